//! User sign-up: one synchronous step, two deferred side effects.
//!
//! Creating the account must succeed before anything else happens and its
//! error goes straight back to the caller. The newsletter subscription and
//! the welcome notification are submitted as independent tasks, so a failing
//! newsletter service never holds back the notification (or vice versa).

use std::sync::Arc;

use thiserror::Error;
use tracing::info;

use courier_core::{Task, User};

use crate::dispatcher::{DispatchError, Dispatcher};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("failed to create user account: {0}")]
pub struct RepositoryError(pub String);

pub trait UserRepository: Send + Sync {
    fn create_user_account(&self, user: &User) -> Result<(), RepositoryError>;
}

#[derive(Debug, Error)]
pub enum SignupError {
    #[error(transparent)]
    Repository(#[from] RepositoryError),

    #[error("account created but follow-up tasks were not accepted: {0}")]
    Dispatch(#[from] DispatchError),
}

pub struct SignupService {
    repository: Arc<dyn UserRepository>,
    dispatcher: Dispatcher,
}

impl SignupService {
    pub fn new(repository: Arc<dyn UserRepository>, dispatcher: Dispatcher) -> Self {
        Self {
            repository,
            dispatcher,
        }
    }

    pub fn sign_up(&self, user: User) -> Result<(), SignupError> {
        self.repository.create_user_account(&user)?;
        info!(email = %user.email, "user account created");

        self.dispatcher.submit_all([
            Task::add_to_newsletter(user.clone()),
            Task::send_notification(user),
        ])?;
        Ok(())
    }
}
