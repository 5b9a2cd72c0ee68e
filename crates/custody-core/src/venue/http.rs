//! HTTP clients for the venue collaborators.
//!
//! Thin reqwest wrappers over the ledger query service and the transaction
//! build service. Retries are limited to transient failures (5xx and 429);
//! other client errors fail immediately so venue rejections surface
//! verbatim.

use super::{
    IntentBuilder, IntentKind, LedgerQuery, SubaccountBalance, SubmitReceipt, TxStatus,
    UnsignedIntent, VenueGateway, VenueOps,
};
use crate::types::{OpenPosition, SignedTransaction, SubaccountRef};
use crate::{Error, Result, VenueError};
use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::Deserialize;
use std::time::Duration;
use tracing::warn;
use uuid::Uuid;

/// HTTP client for the ledger query service and venue operations.
pub struct VenueHttpClient {
    ledger_url: String,
    intent_url: String,
    http_client: reqwest::Client,
}

#[derive(Debug, Deserialize)]
struct BalanceResponse {
    balance: Decimal,
    exists: bool,
}

#[derive(Debug, Deserialize)]
struct WalletBalanceResponse {
    balance: Decimal,
}

#[derive(Debug, Deserialize)]
struct SweepResponse {
    amount: Decimal,
}

#[derive(Debug, Deserialize)]
struct ProvisionResponse {
    address: String,
}

#[derive(Debug, Deserialize)]
struct VenueErrorBody {
    error: String,
}

impl VenueHttpClient {
    /// Default ledger query service base URL.
    pub const DEFAULT_LEDGER_URL: &'static str = "http://localhost:8899";
    /// Default transaction build service base URL.
    pub const DEFAULT_INTENT_URL: &'static str = "http://localhost:8900";

    /// Maximum retry attempts for transient failures.
    const MAX_RETRIES: u32 = 3;

    pub fn new(ledger_url: Option<String>, intent_url: Option<String>) -> Self {
        let http_client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .connect_timeout(Duration::from_secs(10))
            .build()
            .expect("Failed to build HTTP client");
        Self {
            ledger_url: ledger_url.unwrap_or_else(|| Self::DEFAULT_LEDGER_URL.to_string()),
            intent_url: intent_url.unwrap_or_else(|| Self::DEFAULT_INTENT_URL.to_string()),
            http_client,
        }
    }

    /// Execute an HTTP GET with retry and exponential backoff.
    ///
    /// Retries on 5xx server errors and 429 rate-limit responses. All
    /// other 4xx errors fail immediately as venue errors.
    async fn get_with_retry(&self, url: &str) -> Result<reqwest::Response> {
        let mut last_error = None;

        for attempt in 0..Self::MAX_RETRIES {
            match self.http_client.get(url).send().await {
                Ok(response) if response.status().is_success() => return Ok(response),
                Ok(response)
                    if response.status().as_u16() == 429 || response.status().is_server_error() =>
                {
                    let status = response.status();
                    warn!(
                        attempt = attempt + 1,
                        status = %status,
                        url = url,
                        "Retryable ledger error, backing off"
                    );
                    last_error = Some(Error::Venue(VenueError::from_message(format!(
                        "ledger returned {}",
                        status
                    ))));
                }
                Ok(response) => return Err(Self::venue_error(response).await),
                Err(e) => {
                    warn!(
                        attempt = attempt + 1,
                        error = %e,
                        url = url,
                        "HTTP request failed, backing off"
                    );
                    last_error = Some(Error::Http(e));
                }
            }

            if attempt + 1 < Self::MAX_RETRIES {
                let backoff = Duration::from_millis(500 * 2u64.pow(attempt));
                tokio::time::sleep(backoff).await;
            }
        }

        Err(last_error.unwrap_or_else(|| Error::Venue(VenueError::from_message("request failed"))))
    }

    /// POST a JSON body; no retry — venue mutations must not be replayed
    /// blindly.
    async fn post_json(&self, url: &str, body: &serde_json::Value) -> Result<reqwest::Response> {
        let response = self.http_client.post(url).json(body).send().await?;
        if response.status().is_success() {
            Ok(response)
        } else {
            Err(Self::venue_error(response).await)
        }
    }

    /// Turn an error response into a typed venue error, keeping the venue's
    /// message verbatim.
    async fn venue_error(response: reqwest::Response) -> Error {
        let status = response.status();
        let message = match response.json::<VenueErrorBody>().await {
            Ok(body) => body.error,
            Err(_) => format!("venue returned {}", status),
        };
        Error::Venue(VenueError::from_message(message))
    }
}

#[async_trait]
impl LedgerQuery for VenueHttpClient {
    async fn subaccount_balance(&self, subaccount: &SubaccountRef) -> Result<SubaccountBalance> {
        let url = format!(
            "{}/v1/subaccounts/{}/{}/balance",
            self.ledger_url, subaccount.wallet_address, subaccount.index
        );
        let response = self.get_with_retry(&url).await?;
        let body: BalanceResponse = response.json().await?;
        Ok(SubaccountBalance {
            balance: body.balance,
            exists: body.exists,
        })
    }

    async fn wallet_balance(&self, address: &str) -> Result<Decimal> {
        let url = format!("{}/v1/wallets/{}/balance", self.ledger_url, address);
        let response = self.get_with_retry(&url).await?;
        let body: WalletBalanceResponse = response.json().await?;
        Ok(body.balance)
    }

    async fn native_balance(&self, address: &str) -> Result<Decimal> {
        let url = format!("{}/v1/wallets/{}/native-balance", self.ledger_url, address);
        let response = self.get_with_retry(&url).await?;
        let body: WalletBalanceResponse = response.json().await?;
        Ok(body.balance)
    }

    async fn open_positions(&self, subaccount: &SubaccountRef) -> Result<Vec<OpenPosition>> {
        let url = format!(
            "{}/v1/subaccounts/{}/{}/positions",
            self.ledger_url, subaccount.wallet_address, subaccount.index
        );
        let response = self.get_with_retry(&url).await?;
        Ok(response.json().await?)
    }

    async fn transaction_status(
        &self,
        tx_signature: &str,
        confirmation_hints: &serde_json::Value,
    ) -> Result<TxStatus> {
        let url = format!("{}/v1/transactions/{}/status", self.ledger_url, tx_signature);
        let response = self
            .http_client
            .get(&url)
            .query(&[("hints", confirmation_hints.to_string())])
            .send()
            .await?;
        if response.status().as_u16() == 404 {
            return Ok(TxStatus::Unknown);
        }
        if !response.status().is_success() {
            return Err(Self::venue_error(response).await);
        }
        Ok(response.json().await?)
    }
}

#[async_trait]
impl IntentBuilder for VenueHttpClient {
    async fn build_intent(&self, kind: IntentKind) -> Result<UnsignedIntent> {
        let url = format!("{}/v1/intents", self.intent_url);
        let body = serde_json::to_value(&kind)?;
        let response = self.post_json(&url, &body).await?;
        Ok(response.json().await?)
    }
}

#[async_trait]
impl VenueGateway for VenueHttpClient {
    async fn submit(&self, signed_tx: &SignedTransaction) -> Result<SubmitReceipt> {
        let url = format!("{}/v1/transactions", self.intent_url);
        let body = serde_json::to_value(signed_tx)?;
        let response = self.post_json(&url, &body).await?;
        Ok(response.json().await?)
    }
}

#[async_trait]
impl VenueOps for VenueHttpClient {
    async fn close_position(&self, subaccount: &SubaccountRef, position_id: &str) -> Result<()> {
        let url = format!(
            "{}/v1/subaccounts/{}/{}/positions/{}/close",
            self.ledger_url, subaccount.wallet_address, subaccount.index, position_id
        );
        self.post_json(&url, &serde_json::json!({})).await?;
        Ok(())
    }

    async fn settle_pnl(&self, subaccount: &SubaccountRef) -> Result<()> {
        let url = format!(
            "{}/v1/subaccounts/{}/{}/settle",
            self.ledger_url, subaccount.wallet_address, subaccount.index
        );
        self.post_json(&url, &serde_json::json!({})).await?;
        Ok(())
    }

    async fn sweep_to_main(&self, subaccount: &SubaccountRef) -> Result<Decimal> {
        let url = format!(
            "{}/v1/subaccounts/{}/{}/sweep",
            self.ledger_url, subaccount.wallet_address, subaccount.index
        );
        let response = self.post_json(&url, &serde_json::json!({})).await?;
        let body: SweepResponse = response.json().await?;
        Ok(body.amount)
    }

    async fn close_subaccount(&self, subaccount: &SubaccountRef) -> Result<Decimal> {
        let url = format!(
            "{}/v1/subaccounts/{}/{}/close",
            self.ledger_url, subaccount.wallet_address, subaccount.index
        );
        let response = self.post_json(&url, &serde_json::json!({})).await?;
        let body: SweepResponse = response.json().await?;
        Ok(body.amount)
    }

    async fn provision_wallet(&self, user_id: Uuid) -> Result<String> {
        let url = format!("{}/v1/wallets", self.intent_url);
        let body = serde_json::json!({ "user_id": user_id });
        let response = self.post_json(&url, &body).await?;
        let body: ProvisionResponse = response.json().await?;
        Ok(body.address)
    }
}
