//! Command handlers for the porter-auth binary.

use std::sync::Arc;

use anyhow::{anyhow, bail, Context, Result};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use porter_auth_core::auth::SESSION_EXPIRED_MESSAGE;
use porter_auth_core::validation::{self, Field, ValidationResult};
use porter_auth_core::{
    Config, CredentialStore, RequestGateway, SessionController, SessionError, SessionStatus,
};

use crate::prompt;

pub struct App {
    config: Config,
    controller: SessionController,
    /// Startup check of a stored session, awaited before any command acts.
    startup_check: Option<JoinHandle<Result<(), SessionError>>>,
}

impl App {
    pub fn new(config: Config) -> Result<Self> {
        let storage = config
            .open_storage()
            .context("Failed to open credential storage")?;
        let store = CredentialStore::open(storage);
        if CredentialStore::install_global(store.clone()).is_err() {
            debug!("Credential store already installed");
        }

        let gateway = Arc::new(RequestGateway::from_config(&config, store)?);
        // Terminal equivalent of sending the user back to the sign-in page
        gateway.add_listener(Arc::new(|| eprintln!("{}", SESSION_EXPIRED_MESSAGE)));

        let (controller, startup_check) = SessionController::start(gateway);
        Ok(Self {
            config,
            controller,
            startup_check,
        })
    }

    /// Wait for the startup check so commands see the confirmed state.
    async fn settle(&mut self) -> Result<()> {
        if let Some(check) = self.startup_check.take() {
            match check.await.context("Verification task failed")? {
                Ok(()) => debug!("Stored session confirmed"),
                Err(e) => debug!(error = %e, "Stored session rejected"),
            }
        }
        Ok(())
    }

    fn remember_email(&mut self, email: &str) {
        self.config.last_email = Some(email.to_string());
        if let Err(e) = self.config.save() {
            warn!(error = %e, "Failed to save config");
        }
    }

    pub async fn login(&mut self, email: Option<String>) -> Result<()> {
        self.settle().await?;
        if self.controller.is_authenticated() {
            if let Some(user) = self.controller.current_user() {
                println!("Already signed in as {}.", user.display_name());
            }
            println!("Run `porter-auth logout` first to switch accounts.");
            return Ok(());
        }

        let email = match email {
            Some(email) => email,
            None => prompt::line("Email", self.config.last_email.as_deref())?,
        };
        let password = prompt::password("Password")?;

        let user = self
            .controller
            .login(&email, &password)
            .await
            .map_err(report)?;
        self.remember_email(&email);
        println!("Signed in as {}.", user.display_name());
        Ok(())
    }

    pub async fn signup(&mut self, email: Option<String>) -> Result<()> {
        self.settle().await?;
        let email = match email {
            Some(email) => email,
            None => prompt::line("Email", None)?,
        };
        let name = prompt::line("Name", None)?;

        let password = prompt::password("Password")?;
        print_password_feedback(&password);
        let confirm = prompt::password("Confirm password")?;

        let form = validation::validate_signup_form(&email, &password, &confirm);
        if !form.is_valid() {
            print_field_errors(&form);
            bail!("Signup form has errors");
        }

        let user = self
            .controller
            .signup(&email, &password, &name)
            .await
            .map_err(report)?;
        self.remember_email(&email);
        println!("Account created. Signed in as {}.", user.display_name());
        Ok(())
    }

    pub async fn logout(&mut self) -> Result<()> {
        self.settle().await?;
        let was_signed_in = self.controller.is_authenticated();
        self.controller.logout().await;
        if was_signed_in {
            println!("Signed out.");
        } else {
            println!("Not signed in.");
        }
        Ok(())
    }

    pub async fn status(&mut self, json: bool) -> Result<()> {
        self.settle().await?;

        let state = self.controller.state();
        if json {
            println!("{}", serde_json::to_string_pretty(&state)?);
            return Ok(());
        }

        println!("Status: {}", state.status());
        if let Some(user) = state.profile() {
            println!("User:   {} <{}> (id {})", user.display_name(), user.email, user.id);
        }
        if let Some(error) = state.error() {
            println!("Note:   {}", error);
        }
        println!("Server: {}", self.controller.gateway().base_url());
        Ok(())
    }

    pub async fn verify(&mut self) -> Result<()> {
        self.settle().await?;
        self.controller.verify_session().await.map_err(report)?;
        println!("Session is valid.");
        Ok(())
    }

    pub async fn refresh(&mut self) -> Result<()> {
        self.settle().await?;
        if self.controller.status() != SessionStatus::Authenticated {
            bail!("Not signed in");
        }
        self.controller
            .gateway()
            .refresh_token()
            .await
            .context("Token refresh failed")?;
        println!("Access token refreshed.");
        Ok(())
    }
}

/// Print field errors and turn the session error into its user-facing text.
/// The full chain still goes to the log.
fn report(error: SessionError) -> anyhow::Error {
    if let SessionError::Validation(form) = &error {
        print_field_errors(form);
    }
    debug!(error = ?error, "Session operation failed");
    anyhow!("{}", error.user_message())
}

fn print_field_errors(form: &ValidationResult) {
    for (field, message) in &form.errors {
        eprintln!("  {}: {}", field_label(*field), message);
    }
}

fn field_label(field: Field) -> &'static str {
    match field {
        Field::Email => "Email",
        Field::Password => "Password",
        Field::ConfirmPassword => "Confirm password",
    }
}

fn print_password_feedback(password: &str) {
    let strength = validation::password_strength(password);
    let missing = validation::password_feedback(password);
    if missing.is_empty() {
        println!("Password strength: {}/5", strength);
    } else {
        println!("Password strength: {}/5 (needs {})", strength, missing.join(", "));
    }
}
