use pkcs11_sys::CK_ULONG;

use crate::{Module, PResult, SessionHandle};

impl Module {
    /// Mix `seed` into the token's random generator; returns `seed`.
    pub fn seed_random<'a>(&self, session: SessionHandle, seed: &'a [u8]) -> PResult<&'a [u8]> {
        let seed_len = CK_ULONG::try_from(seed.len())?;
        self.with_session(session, |state| {
            p11_call!(
                self.functions,
                "Failed seeding the random generator",
                C_SeedRandom,
                state.native,
                seed.as_ptr().cast_mut(),
                seed_len
            )
        })?;
        Ok(seed)
    }

    /// Fill `buffer` with random bytes from the token; returns `buffer`.
    pub fn generate_random<'a>(
        &self,
        session: SessionHandle,
        buffer: &'a mut [u8],
    ) -> PResult<&'a mut [u8]> {
        let len = CK_ULONG::try_from(buffer.len())?;
        self.with_session(session, |state| {
            p11_call!(
                self.functions,
                "Failed generating random data",
                C_GenerateRandom,
                state.native,
                buffer.as_mut_ptr(),
                len
            )
        })?;
        Ok(buffer)
    }
}
