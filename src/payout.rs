use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use url::Url;

use crate::config::Config;
use crate::logging::{log, log_payout, obj, params_hash, v_str, Domain, Level};
use crate::models::Withdrawal;
use crate::signing::sign_message;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransferReceipt {
    #[serde(default)]
    pub transaction_hash: Option<String>,
}

/// Moves tokens to a withdrawal's destination address.
///
/// Called once per withdrawal. Implementations must not retry: a failed
/// transfer leaves the withdrawal FAILED and the user submits a new request.
#[async_trait]
pub trait TokenTransferService {
    async fn transfer(&self, withdrawal: &Withdrawal, amount: i64) -> Result<TransferReceipt>;
}

#[async_trait]
impl<T: TokenTransferService + Send + Sync + ?Sized> TokenTransferService for Box<T> {
    async fn transfer(&self, withdrawal: &Withdrawal, amount: i64) -> Result<TransferReceipt> {
        (**self).transfer(withdrawal, amount).await
    }
}

/// Stand-in used when no shared secret is configured; every transfer fails.
pub struct UnconfiguredTransfer;

#[async_trait]
impl TokenTransferService for UnconfiguredTransfer {
    async fn transfer(&self, withdrawal: &Withdrawal, _amount: i64) -> Result<TransferReceipt> {
        Err(anyhow!(
            "payouts are not configured; withdrawal {} was not sent",
            withdrawal.id
        ))
    }
}

/// HTTP transfers when a shared secret is available, otherwise the stub.
pub fn build(cfg: &Config) -> Result<Box<dyn TokenTransferService + Send + Sync>> {
    if cfg.shared_secret.is_some() {
        log_transport("http");
        Ok(Box::new(HttpTransferService::new(cfg)?))
    } else {
        log_transport("unconfigured");
        Ok(Box::new(UnconfiguredTransfer))
    }
}

fn log_transport(kind: &str) {
    log(
        Level::Info,
        Domain::Payout,
        "transport",
        obj(&[("type", v_str(kind))]),
    );
}

#[derive(Debug, Serialize)]
struct TransferMessage<'a> {
    withdrawal_id: i64,
    user_id: i64,
    token_address: &'a str,
    to_address: &'a str,
    amount: i64,
}

#[derive(Debug, Serialize)]
struct SignedRequest {
    message: String,
    signature: String,
}

/// Relays transfers to the token service over HTTP.
pub struct HttpTransferService {
    client: Client,
    endpoint: Url,
    shared_secret: String,
}

impl HttpTransferService {
    pub fn new(cfg: &Config) -> Result<Self> {
        let shared_secret = cfg
            .shared_secret
            .clone()
            .ok_or_else(|| anyhow!("WEB3_SHARED_SECRET is required for payouts"))?;
        let endpoint = Url::parse(&cfg.payout_base)
            .and_then(|base| base.join("/ethereum/withdrawal"))
            .with_context(|| format!("invalid payout base {}", cfg.payout_base))?;
        let client = Client::builder()
            .timeout(Duration::from_secs(cfg.payout_timeout_secs))
            .build()?;
        Ok(Self { client, endpoint, shared_secret })
    }

    fn signed_body(&self, withdrawal: &Withdrawal, amount: i64) -> Result<SignedRequest> {
        let message = serde_json::to_string(&TransferMessage {
            withdrawal_id: withdrawal.id,
            user_id: withdrawal.user_id,
            token_address: &withdrawal.token_address,
            to_address: &withdrawal.to_address,
            amount,
        })?;
        let signature = sign_message(&message, &self.shared_secret).map_err(|e| anyhow!(e))?;
        Ok(SignedRequest { message, signature })
    }
}

#[async_trait]
impl TokenTransferService for HttpTransferService {
    async fn transfer(&self, withdrawal: &Withdrawal, amount: i64) -> Result<TransferReceipt> {
        let body = self.signed_body(withdrawal, amount)?;
        let hash = params_hash(&body.message);

        let resp = self
            .client
            .post(self.endpoint.clone())
            .json(&body)
            .send()
            .await
            .with_context(|| format!("transfer request for withdrawal {}", withdrawal.id))?;

        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            log_payout(withdrawal.id, amount, "rejected", Some(&hash));
            return Err(anyhow!("token service returned {}: {}", status.as_u16(), text));
        }

        let receipt = resp.json::<TransferReceipt>().await.unwrap_or(TransferReceipt {
            transaction_hash: None,
        });
        log_payout(withdrawal.id, amount, "ok", Some(&hash));
        Ok(receipt)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::WithdrawalStatus;
    use crate::signing::verify_message;
    use chrono::Utc;

    fn cfg() -> Config {
        let mut cfg = Config::from_env();
        cfg.payout_base = "http://localhost:8080/api/".to_string();
        cfg.shared_secret = Some("s3cret".to_string());
        cfg
    }

    fn withdrawal() -> Withdrawal {
        Withdrawal {
            id: 12,
            user_id: 3,
            token_address: "0xtoken".to_string(),
            to_address: "0xdest".to_string(),
            amount: 400,
            status: WithdrawalStatus::Pending,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_requires_shared_secret() {
        let mut c = cfg();
        c.shared_secret = None;
        assert!(HttpTransferService::new(&c).is_err());
    }

    #[test]
    fn test_endpoint_is_rooted() {
        let svc = HttpTransferService::new(&cfg()).unwrap();
        assert_eq!(svc.endpoint.as_str(), "http://localhost:8080/ethereum/withdrawal");
    }

    #[tokio::test]
    async fn test_unconfigured_transport_fails_every_transfer() {
        let mut c = cfg();
        c.shared_secret = None;
        let svc = build(&c).unwrap();
        let err = svc.transfer(&withdrawal(), 400).await.unwrap_err();
        assert!(err.to_string().contains("withdrawal 12"));
    }

    #[test]
    fn test_body_is_signed() {
        let svc = HttpTransferService::new(&cfg()).unwrap();
        let body = svc.signed_body(&withdrawal(), 400).unwrap();
        assert!(body.message.contains("\"to_address\":\"0xdest\""));
        assert!(verify_message(&body.message, "s3cret", &body.signature));
    }
}
