use std::fmt::Debug;
use std::sync::Arc;

use async_trait::async_trait;
use futures::sink::{Sink, SinkExt};
use pgwire::api::auth::{
    DefaultServerParameterProvider, LoginInfo, StartupHandler, finish_authentication,
    protocol_negotiation, save_startup_parameters_to_metadata,
};
use pgwire::api::{ClientInfo, PgWireConnectionState};
use pgwire::error::{PgWireError, PgWireResult};
use pgwire::messages::startup::Authentication;
use pgwire::messages::{PgWireBackendMessage, PgWireFrontendMessage};

use crate::identity::{Directory, IdentityProvider};

/// Cleartext-password startup handshake, checked against the bcrypt hashes
/// in the account directory.
pub struct SlotdStartupHandler {
    directory: Arc<Directory>,
    parameters: DefaultServerParameterProvider,
}

impl SlotdStartupHandler {
    pub fn new(directory: Arc<Directory>) -> Self {
        Self { directory, parameters: DefaultServerParameterProvider::default() }
    }

    async fn verify(&self, user: String, password: String) -> PgWireResult<()> {
        let directory = self.directory.clone();
        let name = user.clone();
        let verified = tokio::task::spawn_blocking(move || directory.authenticate(&name, &password))
            .await
            .map_err(|e| PgWireError::ApiError(Box::new(e)))?;
        match verified {
            Ok(_) => Ok(()),
            Err(e) => {
                metrics::counter!(crate::observability::AUTH_FAILURES_TOTAL).increment(1);
                tracing::warn!(user, "login rejected: {e}");
                Err(PgWireError::InvalidPassword(user))
            }
        }
    }
}

#[async_trait]
impl StartupHandler for SlotdStartupHandler {
    async fn on_startup<C>(&self, client: &mut C, message: PgWireFrontendMessage) -> PgWireResult<()>
    where
        C: ClientInfo + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::Error: Debug,
        PgWireError: From<<C as Sink<PgWireBackendMessage>>::Error>,
    {
        match message {
            PgWireFrontendMessage::Startup(ref startup) => {
                protocol_negotiation(client, startup).await?;
                save_startup_parameters_to_metadata(client, startup);
                client.set_state(PgWireConnectionState::AuthenticationInProgress);
                client
                    .send(PgWireBackendMessage::Authentication(Authentication::CleartextPassword))
                    .await?;
            }
            PgWireFrontendMessage::PasswordMessageFamily(pwd) => {
                let pwd = pwd.into_password()?;
                let user = LoginInfo::from_client_info(client).user().unwrap_or_default().to_owned();
                self.verify(user, pwd.password).await?;
                finish_authentication(client, &self.parameters).await?;
            }
            _ => {}
        }
        Ok(())
    }
}
