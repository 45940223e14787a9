use carrot_cake_channel_pool::amqp::configuration::RabbitMqSettings;
use carrot_cake_channel_pool::amqp::options::{BasicPublishOptions, ConfirmSelectOptions};
use carrot_cake_channel_pool::amqp::{BasicProperties, ConnectionFactory};
use carrot_cake_channel_pool::pool::{ChannelPool, ReconnectSettings};

#[tokio::main]
async fn main() -> Result<(), anyhow::Error> {
    // initialize rabbitmq connection details and config.
    let settings = RabbitMqSettings {
        uri: "localhost".into(),
        vhost: "/".into(),
        username: "rabbitmq".into(),
        password: "password".to_owned().into(),
        connection_timeout_seconds: Default::default(),
        port: 6743,
        tls: None,
    };

    // A pool of 16 channels sharing one connection, retrying for at most a minute
    // if the broker goes away.
    let pool = ChannelPool::builder(ConnectionFactory::new_from_config(&settings)?)
        .capacity(16)
        .reconnect(ReconnectSettings {
            max_elapsed_seconds: Some(60),
            ..ReconnectSettings::default()
        })
        .build()
        .await?;

    let channel = pool.get().await?;
    channel
        .confirm_select(ConfirmSelectOptions { nowait: false })
        .await?;
    let confirmation = channel
        .basic_publish(
            "exchange_name",
            "routing_key",
            BasicPublishOptions::default(),
            "publish_payload".as_bytes(),
            BasicProperties::default(),
        )
        .await?
        .await?;
    println!("Broker confirmation: {confirmation:?}");

    // Give the channel back: from now on `channel` refuses to forward anything.
    channel.release();
    assert!(channel.is_released());

    println!("Pool status: {:?}", pool.status().await);
    pool.close().await?;
    Ok(())
}
