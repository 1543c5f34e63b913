//! Interactive service password prompt

use dialoguer::Password;

use revish_core::credentials::{CredentialError, CredentialProvider, ServiceCredentials};

/// Credential provider that asks on the terminal after a rejection
pub struct DialoguerCredentials {
    initial: ServiceCredentials,
}

impl DialoguerCredentials {
    /// Use `password` first, or prompt for one right away when none is set
    pub fn new(user: String, password: Option<String>) -> Result<Self, CredentialError> {
        let password = match password {
            Some(password) => password,
            None => prompt(&user)?,
        };
        Ok(Self {
            initial: ServiceCredentials::new(user, password),
        })
    }
}

impl CredentialProvider for DialoguerCredentials {
    fn initial(&self) -> ServiceCredentials {
        self.initial.clone()
    }

    fn prompt_password(&self, user: &str) -> Result<String, CredentialError> {
        prompt(user)
    }
}

fn prompt(user: &str) -> Result<String, CredentialError> {
    if !crossterm::tty::IsTty::is_tty(&std::io::stdin()) {
        return Err(CredentialError::NonInteractive);
    }
    Password::new()
        .with_prompt(format!("Password for {}", user))
        .allow_empty_password(true)
        .interact()
        .map_err(|e| CredentialError::Prompt(e.to_string()))
}
