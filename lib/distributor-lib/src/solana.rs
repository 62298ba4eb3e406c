use crate::{builder::BlockhashContext, context::rpc::SolanaRpc};
use solana_client::{
    client_error::{ClientError, ClientErrorKind},
    rpc_request::{RpcError, RpcResponseErrorData},
    rpc_response::RpcSimulateTransactionResult,
};
use solana_sdk::{commitment_config::CommitmentConfig, signature::Signature};
use std::time::Duration;
use tokio::time::Instant;

/// Error message with the RPC code and, for preflight failures, the
/// simulation logs.
pub fn verbose_solana_error(err: &ClientError) -> String {
    use std::fmt::Write;
    if let ClientErrorKind::RpcError(RpcError::RpcResponseError {
        code,
        message,
        data,
    }) = err.kind()
    {
        let mut s = String::new();
        let _ = writeln!(s, "{} ({})", message, code);
        if let RpcResponseErrorData::SendTransactionPreflightFailure(
            RpcSimulateTransactionResult {
                logs: Some(logs), ..
            },
        ) = data
        {
            for (i, log) in logs.iter().enumerate() {
                let _ = writeln!(s, "{}: {}", i + 1, log);
            }
        }
        s
    } else {
        err.to_string()
    }
}

/// Final state of a submitted transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Confirmation {
    Confirmed,
    /// Landed with an execution error.
    Failed(String),
    /// Not seen before the blockhash lapsed, or before the timeout.
    Expired,
}

/// Poll until `signature` reaches `commitment`, fails on chain, or its
/// blockhash can no longer be included.
pub async fn wait_for_confirmation<R: SolanaRpc + ?Sized>(
    rpc: &R,
    signature: &Signature,
    context: &BlockhashContext,
    commitment: CommitmentConfig,
    poll_interval: Duration,
    timeout: Duration,
) -> Confirmation {
    let start = Instant::now();
    loop {
        match rpc.signature_status(signature, commitment).await {
            Ok(Some(Ok(()))) => return Confirmation::Confirmed,
            Ok(Some(Err(error))) => return Confirmation::Failed(error.to_string()),
            Ok(None) => {}
            Err(error) => tracing::warn!("status of {} unavailable: {}", signature, error),
        }

        match rpc.block_height(commitment).await {
            Ok(height) if height > context.last_valid_block_height => {
                // it could have landed in the last valid block
                return match rpc.signature_status(signature, commitment).await {
                    Ok(Some(Ok(()))) => Confirmation::Confirmed,
                    Ok(Some(Err(error))) => Confirmation::Failed(error.to_string()),
                    _ => Confirmation::Expired,
                };
            }
            Ok(_) => {}
            Err(error) => tracing::warn!("failed to get block height: {}", error),
        }

        if start.elapsed() >= timeout {
            tracing::warn!("gave up waiting for {} after {:?}", signature, timeout);
            return Confirmation::Expired;
        }
        tokio::time::sleep(poll_interval).await;
    }
}
