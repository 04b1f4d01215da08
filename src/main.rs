use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use base64::Engine;
use chrono::Local;
use serde::{Deserialize, Serialize};
use solana_client::nonblocking::rpc_client::RpcClient;
use solana_sdk::{
    commitment_config::CommitmentConfig,
    signature::{read_keypair_file, Keypair, Signature},
};
use std::sync::Arc;
use std::time::Instant;
use tower_http::trace::TraceLayer;
use tpu_direct_sender::{
    engine::{QuicTransport, Result as SendResult},
    settings::ServiceSettings,
    TpuClient, TpuSenderError,
};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

struct AppState {
    tpu_client: TpuClient<QuicTransport>,
}

#[derive(Deserialize, Debug, Default, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
enum TxnEncoding {
    #[default]
    Base64,
    Base58,
}

#[derive(Deserialize, Debug)]
struct TransactionRequest {
    txn: String,
    #[serde(default)]
    encoding: TxnEncoding,
}

impl TransactionRequest {
    fn decode(&self) -> Result<Vec<u8>, String> {
        match self.encoding {
            TxnEncoding::Base64 => base64::engine::general_purpose::STANDARD
                .decode(self.txn.trim())
                .map_err(|err| format!("invalid base64 transaction: {err}")),
            TxnEncoding::Base58 => bs58::decode(self.txn.trim())
                .into_vec()
                .map_err(|err| format!("invalid base58 transaction: {err}")),
        }
    }
}

#[derive(Serialize, Debug)]
struct TransactionResponse {
    status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    signature: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
    processing_time_ms: u64,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenv::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_timer(tracing_subscriber::fmt::time::time())
        .with_target(false)
        .with_thread_ids(true)
        .with_level(true)
        .with_file(true)
        .with_line_number(true)
        .init();

    let settings = ServiceSettings::from_env()?;
    let identity = match &settings.identity_keypair {
        Some(path) => read_keypair_file(path)?,
        None => {
            warn!("IDENTITY_KEYPAIR not set, using an ephemeral QUIC identity");
            Keypair::new()
        }
    };

    let rpc_client = Arc::new(RpcClient::new(settings.rpc_url.clone()));
    let tpu_client = TpuClient::new(
        rpc_client,
        &settings.ws_url,
        &identity,
        settings.tpu_client_config.clone(),
    )
    .await?;
    info!(
        rpc_url = %settings.rpc_url,
        fanout_slots = tpu_client.backend().fanout_slots(),
        "TPU client ready"
    );

    let state = Arc::new(AppState { tpu_client });
    let app = Router::new()
        .route("/", get(get_time))
        .route("/send_txn", post(handle_transaction))
        .route("/send_and_confirm_txn", post(handle_send_and_confirm))
        .layer(TraceLayer::new_for_http())
        .with_state(state.clone());

    let listener = tokio::net::TcpListener::bind(settings.bind_addr).await?;
    info!(addr = %listener.local_addr()?, "Listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    if let Ok(mut state) = Arc::try_unwrap(state) {
        state.tpu_client.shutdown().await;
    }
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        error!(error = %err, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    info!("Shutting down");
}

async fn handle_transaction(
    State(state): State<Arc<AppState>>,
    Json(request): Json<TransactionRequest>,
) -> Response {
    let start_time = Instant::now();
    let wire_transaction = match request.decode() {
        Ok(wire_transaction) => wire_transaction,
        Err(err) => return error_response(StatusCode::BAD_REQUEST, err, start_time),
    };
    info!(
        transaction_size = wire_transaction.len(),
        "Received transaction request"
    );

    let result = state.tpu_client.send_wire_transaction(wire_transaction);
    send_response(result, "sent", start_time)
}

async fn handle_send_and_confirm(
    State(state): State<Arc<AppState>>,
    Json(request): Json<TransactionRequest>,
) -> Response {
    let start_time = Instant::now();
    let wire_transaction = match request.decode() {
        Ok(wire_transaction) => wire_transaction,
        Err(err) => return error_response(StatusCode::BAD_REQUEST, err, start_time),
    };
    info!(
        transaction_size = wire_transaction.len(),
        "Received send and confirm request"
    );

    let result = state
        .tpu_client
        .send_and_confirm_wire_transaction(wire_transaction, CommitmentConfig::confirmed())
        .await;
    send_response(result, "confirmed", start_time)
}

fn send_response(result: SendResult<Signature>, status: &str, start_time: Instant) -> Response {
    let processing_time_ms = start_time.elapsed().as_millis() as u64;
    match result {
        Ok(signature) => {
            info!(%signature, processing_time_ms, "Transaction {}", status);
            Json(TransactionResponse {
                status: status.to_string(),
                signature: Some(signature.to_string()),
                error: None,
                processing_time_ms,
            })
            .into_response()
        }
        Err(err) => {
            let status_code = status_for_error(&err);
            warn!(error = %err, status = %status_code, processing_time_ms, "Transaction request failed");
            (
                status_code,
                Json(TransactionResponse {
                    status: "error".to_string(),
                    signature: failed_signature(&err).map(|signature| signature.to_string()),
                    error: Some(err.to_string()),
                    processing_time_ms,
                }),
            )
                .into_response()
        }
    }
}

fn error_response(status_code: StatusCode, error: String, start_time: Instant) -> Response {
    warn!(error = %error, "Rejected transaction request");
    (
        status_code,
        Json(TransactionResponse {
            status: "error".to_string(),
            signature: None,
            error: Some(error),
            processing_time_ms: start_time.elapsed().as_millis() as u64,
        }),
    )
        .into_response()
}

fn status_for_error(err: &TpuSenderError) -> StatusCode {
    match err {
        TpuSenderError::MalformedPayload(_) => StatusCode::BAD_REQUEST,
        TpuSenderError::TransactionFailed { .. } => StatusCode::UNPROCESSABLE_ENTITY,
        TpuSenderError::ConfirmationTimeout(_) => StatusCode::GATEWAY_TIMEOUT,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn failed_signature(err: &TpuSenderError) -> Option<Signature> {
    match err {
        TpuSenderError::TransactionFailed { signature, .. }
        | TpuSenderError::ConfirmationTimeout(signature) => Some(*signature),
        _ => None,
    }
}

async fn get_time() -> impl IntoResponse {
    let current_time = Local::now().to_rfc3339();
    Json(serde_json::json!({
        "time": current_time
    }))
}
