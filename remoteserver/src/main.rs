mod handlers;

use std::net::SocketAddr;

use axum::routing::{get, post};
use axum::Router;
use clap::Parser;
use handlers::AppState;
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "damshare-remoteserver")]
struct Args {
    /// Root directory the share's content is mirrored under.
    #[arg(long, default_value = "./data")]
    data_dir: std::path::PathBuf,

    #[arg(long, default_value_t = 8080)]
    port: u16,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    if let Err(e) = std::fs::create_dir_all(&args.data_dir) {
        eprintln!("warning: could not create data directory: {e}");
    }

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "damshare_remoteserver=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let state = AppState { data_dir: args.data_dir };

    let app = Router::new()
        .route("/health", get(handlers::health))
        .route("/list", get(handlers::list_root))
        .route("/list/*path", get(handlers::list_nested))
        .route("/stat/*path", get(handlers::stat))
        .route("/mkdir/*path", post(handlers::mkdir))
        .route(
            "/files/*path",
            get(handlers::get_file)
                .put(handlers::put_file)
                .post(handlers::post_file)
                .delete(handlers::delete_file)
                .patch(handlers::patch_file),
        )
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    let addr = SocketAddr::from(([127, 0, 0, 1], args.port));
    tracing::debug!("listening on {}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await.unwrap();
    axum::serve(listener, app).await.unwrap();
}
