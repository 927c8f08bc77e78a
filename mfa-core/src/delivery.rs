//! Out-of-band delivery of one-time codes

use async_trait::async_trait;
use tracing::info;

use crate::error::Result;
use crate::types::MethodKind;

/// Transport that carries a one-time code to the user's phone or inbox.
///
/// Failures surface to the caller as [`crate::MfaError::Delivery`]; nothing is
/// retried here.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait DeliveryChannel: Send + Sync {
    async fn send(&self, kind: MethodKind, destination: &str, code: &str) -> Result<()>;
}

/// Development channel that writes deliveries to the log
#[derive(Debug, Clone, Default)]
pub struct ConsoleChannel;

#[async_trait]
impl DeliveryChannel for ConsoleChannel {
    async fn send(&self, kind: MethodKind, destination: &str, code: &str) -> Result<()> {
        info!(
            kind = %kind,
            destination = %mask_destination(destination),
            "[console] one-time code {}",
            code
        );
        Ok(())
    }
}

/// Mask all but the last few characters of a destination for logs
pub fn mask_destination(destination: &str) -> String {
    let chars: Vec<char> = destination.chars().collect();
    let visible = chars.len().min(4);
    let hidden = chars.len() - visible;
    std::iter::repeat('*')
        .take(hidden)
        .chain(chars[hidden..].iter().copied())
        .collect()
}
