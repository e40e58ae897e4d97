//! Arena fixture for unit tests.

#[cfg(test)]
pub mod test {
    use super::super::session::CompilationSession;
    use bumpalo::Bump;

    /// Owns the arena so a test can borrow sessions from it.
    #[derive(Default)]
    pub struct TestContext {
        arena: Bump,
    }

    impl TestContext {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn create_session(&self) -> CompilationSession<'_> {
            CompilationSession::new(&self.arena)
        }
    }
}
