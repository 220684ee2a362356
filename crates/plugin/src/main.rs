use std::sync::Arc;

fn main() {
    // Plugin logs are read by the host from our stderr, and must be structured.
    // Our stdout is reserved for the RPC channel.
    let log_level = std::env::var("LOG_LEVEL").unwrap_or("info".to_string());
    let env_filter = tracing_subscriber::EnvFilter::new(format!(
        "cortex_plugin={log_level},plugin={log_level},providers={log_level},cortex={log_level}"
    ));

    tracing_subscriber::fmt()
        .json()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .with_current_span(false)
        .init();

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build();

    let runtime = match runtime {
        Ok(runtime) => runtime,
        Err(error) => {
            tracing::error!(%error, "couldn't build Tokio runtime");
            std::process::exit(1);
        }
    };

    let handshake = models::Handshake {
        protocol_version: 1,
        magic_cookie_key: "cortex".to_string(),
        magic_cookie_value: "cortexv1".to_string(),
    };
    let uploader = Arc::new(providers::CortexUploader::new(Default::default()));

    let result = runtime.block_on(plugin::serve(&handshake, uploader));

    // Reads of stdin are blocking tasks which may never complete,
    // so don't wait for them as Runtime::Drop would.
    runtime.shutdown_background();

    if let Err(error) = result {
        tracing::error!(error = format!("{error:#}"), "cortex plugin failed");
        std::process::exit(1);
    }
}
