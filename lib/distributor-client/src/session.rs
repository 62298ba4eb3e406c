use std::sync::Arc;
use tokio::sync::watch;

/// Bearer token shared by every client of one user session.
///
/// Signing in or out through any clone is seen by all of them, and by
/// anyone holding a [`subscribe`][Session::subscribe] receiver.
#[derive(Clone)]
pub struct Session {
    token: Arc<watch::Sender<Option<String>>>,
}

impl Default for Session {
    fn default() -> Self {
        Self::new(None)
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("signed_in", &self.is_signed_in())
            .finish()
    }
}

impl Session {
    pub fn new(token: Option<String>) -> Self {
        let (tx, _) = watch::channel(token.filter(|t| !t.is_empty()));
        Self {
            token: Arc::new(tx),
        }
    }

    pub fn token(&self) -> Option<String> {
        self.token.borrow().clone()
    }

    pub fn is_signed_in(&self) -> bool {
        self.token.borrow().is_some()
    }

    pub fn sign_in(&self, token: String) {
        self.token.send_replace(Some(token));
    }

    pub fn sign_out(&self) {
        self.token.send_if_modified(|t| t.take().is_some());
    }

    pub fn subscribe(&self) -> watch::Receiver<Option<String>> {
        self.token.subscribe()
    }
}
