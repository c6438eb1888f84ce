//! A `deadpool::managed::Manager` over `tiberius::Client`.
//!
//! Grounded on the `deadpool-tiberius` crate's `Manager` (TCP connect, then
//! `tiberius::Client::connect`, with one retry on a `Routing` redirect to
//! the server SQL Server hands back during login). That published crate's
//! manager has no hook for the backoff/retry-budget semantics this server
//! needs at *establishment* time, so the retry loop lives in
//! [`crate::ConnectionManager`] instead; this `Manager` only does the one
//! thing deadpool asks of it: produce and recycle single connections.

use async_trait::async_trait;
use deadpool::managed;
use tiberius::{AuthMethod, Config, EncryptionLevel};
use tokio::net::TcpStream;
use tokio_util::compat::{Compat, TokioAsyncWriteCompatExt};

/// A pooled connection's concrete type.
pub type Client = tiberius::Client<Compat<TcpStream>>;

/// Settings needed to build a `tiberius::Config`. A deliberately narrow
/// slice of `mssql_mcp_config::ServerConfig` — this crate does not depend
/// on the config crate, to keep the pool reusable independent of how its
/// settings were resolved.
#[derive(Debug, Clone)]
pub struct ConnectionSettings {
    pub host: String,
    pub port: u16,
    pub database: String,
    pub user: String,
    pub password: String,
    pub domain: String,
    pub encrypt: bool,
    pub trust_server_certificate: bool,
    pub application_name: String,
}

impl ConnectionSettings {
    fn to_tiberius_config(&self) -> Config {
        let mut config = Config::new();
        config.host(&self.host);
        config.port(self.port);
        config.database(&self.database);
        config.application_name(&self.application_name);

        config.authentication(if self.user.is_empty() {
            AuthMethod::Integrated
        } else if self.domain.is_empty() {
            AuthMethod::sql_server(&self.user, &self.password)
        } else {
            AuthMethod::windows(&self.user, &self.password, &self.domain)
        });

        config.encryption(if self.encrypt {
            EncryptionLevel::Required
        } else {
            EncryptionLevel::NotSupported
        });
        if self.trust_server_certificate {
            config.trust_cert();
        }

        config
    }
}

pub struct Manager {
    config: Config,
}

impl Manager {
    pub fn new(settings: &ConnectionSettings) -> Self {
        Self {
            config: settings.to_tiberius_config(),
        }
    }
}

#[async_trait]
impl managed::Manager for Manager {
    type Type = Client;
    type Error = tiberius::error::Error;

    async fn create(&self) -> Result<Client, Self::Error> {
        let tcp = TcpStream::connect(self.config.get_addr()).await?;
        tcp.set_nodelay(true)?;

        match Client::connect(self.config.clone(), tcp.compat_write()).await {
            Ok(client) => Ok(client),
            Err(tiberius::error::Error::Routing { host, port }) => {
                let mut redirected = self.config.clone();
                redirected.host(host);
                redirected.port(port);
                let tcp = TcpStream::connect(redirected.get_addr()).await?;
                tcp.set_nodelay(true)?;
                Client::connect(redirected, tcp.compat_write()).await
            }
            Err(err) => Err(err),
        }
    }

    async fn recycle(
        &self,
        obj: &mut Self::Type,
        _metrics: &managed::Metrics,
    ) -> managed::RecycleResult<Self::Error> {
        match obj.simple_query("").await {
            Ok(_) => Ok(()),
            Err(e) => Err(managed::RecycleError::Message(e.to_string())),
        }
    }
}
