use std::fmt;

use zeroize::Zeroize;

/// Password buffer that is overwritten, not just freed, once used.
///
/// [`Password::scrub`] zeroes the whole allocation and empties the buffer.
/// Dropping a `Password` scrubs it as well.
///
/// Only this buffer is covered. russh takes the password as an owned
/// `String` during authentication, and that copy is freed without being
/// zeroed.
#[derive(Default)]
pub struct Password(Vec<u8>);

impl Password {
    pub fn new(password: &str) -> Self {
        let mut buf = Vec::with_capacity(password.len());
        buf.extend_from_slice(password.as_bytes());
        Self(buf)
    }

    /// Replace the contents, scrubbing the previous value first.
    pub fn set(&mut self, password: &str) {
        self.scrub();
        self.0.extend_from_slice(password.as_bytes());
    }

    pub fn expose(&self) -> &[u8] {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn scrub(&mut self) {
        self.0.zeroize();
    }
}

impl From<String> for Password {
    fn from(mut password: String) -> Self {
        let scrubbed = Self::new(&password);
        password.zeroize();
        scrubbed
    }
}

impl Drop for Password {
    fn drop(&mut self) {
        self.scrub();
    }
}

impl fmt::Debug for Password {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Password(***)")
    }
}
