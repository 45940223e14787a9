use crate::amqp::configuration::RabbitMqSettings;
use crate::broker::Connector;
use anyhow::Context;
use lapin::{
    tcp::{AMQPUriTcpExt, NativeTlsConnector},
    uri::{AMQPScheme, AMQPUri},
    ConnectionProperties,
};
use std::sync::Arc;
use tokio::time::timeout;

#[derive(Clone)]
/// All the information required to connect to a RabbitMq broker.
///
/// `ConnectionFactory` is the [`Connector`] used by
/// [`ChannelPool`](crate::pool::ChannelPool) in production: the pool dials through it once
/// when it is built and again every time the broker drops the connection.
pub struct ConnectionFactory {
    uri: AMQPUri,
    /// The timeout observed when trying to connect to RabbitMq.
    connection_timeout: std::time::Duration,
    /// TLS configuration for the connection to RabbitMq.
    /// If `None`, the connection will not be encrypted.
    tls: Option<Arc<Tls>>,
}

#[derive(Clone)]
struct Tls {
    connector: NativeTlsConnector,
    domain_name: String,
}

impl ConnectionFactory {
    /// Create a new connection factory from settings.
    ///
    /// If the connection timeout is left unspecified, it will be defaulted to 10 seconds.
    pub fn new_from_config(settings: &RabbitMqSettings) -> Result<Self, anyhow::Error> {
        let tls = settings
            .tls
            .as_ref()
            .map::<Result<Tls, anyhow::Error>, _>(|tls_settings| {
                let domain_name = tls_settings
                    .domain
                    .clone()
                    .unwrap_or_else(|| settings.uri.clone());

                let mut connector_builder = NativeTlsConnector::builder();
                if let Some(certificate) = tls_settings.ca_certificate_chain()? {
                    connector_builder.add_root_certificate(certificate);
                }
                let connector = connector_builder
                    .build()
                    .context("Failed to build the TLS connector for RabbitMQ.")?;

                Ok(Tls {
                    connector,
                    domain_name,
                })
            })
            .transpose()?;
        Ok(Self {
            uri: settings.amqp_uri(),
            connection_timeout: settings.connection_timeout(),
            tls: tls.map(Arc::new),
        })
    }

    /// Replaces the TLS connector, along with the expected domain name for the certificate.
    pub fn set_tls_connector_with_domain(
        &mut self,
        connector: NativeTlsConnector,
        domain_name: String,
    ) {
        self.tls = Some(Arc::new(Tls {
            connector,
            domain_name,
        }));
    }

    /// Create a new connection to a RabbitMq broker.
    ///
    /// It establishes an encrypted connection if `self.tls` is `Some`.
    /// It establishes an unencrypted connection if `self.tls` is `None`.
    #[tracing::instrument(name = "rabbitmq_connect", skip(self), fields(host = %self.uri.authority.host))]
    pub async fn new_connection(&self) -> Result<lapin::Connection, anyhow::Error> {
        let properties =
            ConnectionProperties::default().with_executor(tokio_executor_trait::Tokio::current());
        let connection = timeout(self.connection_timeout, async {
            match &self.tls {
                None => self.connect_without_tls(properties).await,
                Some(tls) => self.connect_with_tls(properties, Arc::clone(tls)).await,
            }
        })
        .await
        .context("Timed out while trying to connect to RabbitMQ.")?
        .context("Failed to connect to RabbitMQ.")?;
        Ok(connection)
    }

    async fn connect_without_tls(
        &self,
        properties: ConnectionProperties,
    ) -> Result<lapin::Connection, lapin::Error> {
        lapin::Connection::connect_uri(self.uri.clone(), properties).await
    }

    async fn connect_with_tls(
        &self,
        properties: ConnectionProperties,
        tls_configuration: Arc<Tls>,
    ) -> Result<lapin::Connection, lapin::Error> {
        lapin::Connection::connector(
            self.uri.clone(),
            Box::new(move |uri| {
                // Plain TCP first, then the TLS handshake against the expected domain
                let mut amqp_uri = uri.clone();
                amqp_uri.scheme = AMQPScheme::AMQP;
                amqp_uri.connect().and_then(|tcp| {
                    tcp.into_native_tls(
                        &tls_configuration.connector,
                        &tls_configuration.domain_name,
                    )
                })
            }),
            properties,
        )
        .await
    }
}

#[async_trait::async_trait]
impl Connector for ConnectionFactory {
    type Connection = lapin::Connection;

    async fn connect(&self) -> Result<lapin::Connection, anyhow::Error> {
        self.new_connection().await
    }
}
