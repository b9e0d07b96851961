use std::error::Error;
use std::sync::Arc;

use colabtrack_sdk::api::ApiClient;
use colabtrack_sdk::credentials::{CredentialStore, MemoryCredentialStore};
use colabtrack_sdk::realtime::proto::{CONNECTED, DISCONNECTED, RECONNECTING};
use colabtrack_sdk::realtime::{listener, RealtimeConfig, UpdateClient};
use secrecy::SecretString;
use tracing_subscriber::EnvFilter;

fn main() -> Result<(), Box<dyn Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let token = std::env::var("COLABTRACK_TOKEN")
        .unwrap_or_else(|_| "REPLACE_WITH_ACCESS_TOKEN".to_string());
    let login = std::env::var("COLABTRACK_EMAIL")
        .ok()
        .zip(std::env::var("COLABTRACK_PASSWORD").ok());
    let local = std::env::var("COLABTRACK_LOCAL").is_ok_and(|value| value == "1");

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;

    runtime.block_on(async {
        let credentials: Arc<dyn CredentialStore> =
            Arc::new(MemoryCredentialStore::with_token(SecretString::new(token)));
        let api = ApiClient::new(Arc::clone(&credentials))?.with_local_mode(local);
        if let Some((email, password)) = login {
            let session = api.login(&email, &password).await?;
            println!("logged in as {}", session.user);
        }
        let profile = api.profile().await?;
        println!("profile {profile}");

        let client = UpdateClient::new(
            RealtimeConfig::default().with_local_mode(local),
            credentials,
        );

        client.on(CONNECTED, |_| println!("connected"));
        client.on(DISCONNECTED, |_| println!("disconnected"));
        client.on(RECONNECTING, |payload| println!("reconnecting {payload}"));

        let print_task = listener(|payload| println!("task {payload}"));
        client.subscribe_to_task_updates(&print_task);
        client.subscribe_to_comments(&listener(|payload| println!("comment {payload}")));
        client.subscribe_to_notifications(&listener(|payload| {
            println!("notification {payload}")
        }));

        client.connect();
        tokio::signal::ctrl_c().await?;
        client.disconnect();

        Ok::<(), Box<dyn Error>>(())
    })
}
