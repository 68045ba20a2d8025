use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

use super::models::{ChannelInfo, ChannelPayment, ChannelState, PaymentDirection};
use crate::error::{AppError, AppResult};
use crate::ledger::models::Amount;

/// Access to the payment-channel node
#[async_trait]
pub trait ChannelClient: Send + Sync {
    /// On-chain address of the node; channel books are keyed by it
    fn node_address(&self) -> &str;

    async fn list_channels(&self) -> AppResult<Vec<ChannelInfo>>;

    /// Successful payment events of one channel, skipping the first `offset`
    async fn payments(&self, channel: &ChannelInfo, offset: usize) -> AppResult<Vec<ChannelPayment>>;

    async fn send_payment(
        &self,
        token_address: &str,
        target: &str,
        amount: Amount,
        identifier: u64,
    ) -> AppResult<ChannelPayment>;

    /// Raise the channel's total deposit
    async fn deposit(&self, channel: &ChannelInfo, total_deposit: Amount) -> AppResult<ChannelInfo>;
}

#[derive(Debug, Deserialize)]
struct RestChannel {
    channel_identifier: String,
    token_address: String,
    partner_address: String,
    balance: String,
    total_deposit: String,
    state: String,
}

#[derive(Debug, Deserialize)]
struct RestPaymentEvent {
    event: String,
    amount: String,
    identifier: String,
    #[serde(default)]
    initiator: Option<String>,
    #[serde(default)]
    target: Option<String>,
    log_time: String,
}

#[derive(Debug, Serialize)]
struct PaymentRequest {
    amount: String,
    identifier: String,
}

#[derive(Debug, Serialize)]
struct DepositRequest {
    total_deposit: String,
}

fn parse_amount(value: &str) -> AppResult<Amount> {
    value
        .parse::<Amount>()
        .map_err(|_| AppError::ExternalError(format!("Invalid amount from channel node: {}", value)))
}

fn parse_state(value: &str) -> ChannelState {
    match value {
        "opened" => ChannelState::Opened,
        "settled" => ChannelState::Settled,
        _ => ChannelState::Closed,
    }
}

fn parse_log_time(value: &str) -> AppResult<DateTime<Utc>> {
    // Node reports naive ISO timestamps in UTC
    let parsed = DateTime::parse_from_rfc3339(value)
        .map(|t| t.with_timezone(&Utc))
        .or_else(|_| {
            chrono::NaiveDateTime::parse_from_str(value, "%Y-%m-%dT%H:%M:%S%.f").map(|t| t.and_utc())
        });
    parsed.map_err(|_| AppError::ExternalError(format!("Invalid log time from channel node: {}", value)))
}

impl RestChannel {
    fn into_info(self, chain_id: u64) -> AppResult<ChannelInfo> {
        Ok(ChannelInfo {
            channel_id: self.channel_identifier,
            chain_id,
            token_address: self.token_address.to_lowercase(),
            partner_address: self.partner_address.to_lowercase(),
            balance: parse_amount(&self.balance)?,
            total_deposit: parse_amount(&self.total_deposit)?,
            state: parse_state(&self.state),
        })
    }
}

impl RestPaymentEvent {
    fn into_payment(self, channel: &ChannelInfo) -> AppResult<Option<ChannelPayment>> {
        let (direction, counterparty) = match self.event.as_str() {
            "EventPaymentReceivedSuccess" => (PaymentDirection::Received, self.initiator),
            "EventPaymentSentSuccess" => (PaymentDirection::Sent, self.target),
            _ => return Ok(None),
        };
        let identifier = self
            .identifier
            .parse::<u64>()
            .map_err(|_| AppError::ExternalError(format!("Invalid payment identifier {}", self.identifier)))?;

        Ok(Some(ChannelPayment {
            channel_id: channel.channel_id.clone(),
            token_address: channel.token_address.clone(),
            direction,
            counterparty: counterparty.unwrap_or_default().to_lowercase(),
            amount: parse_amount(&self.amount)?,
            identifier,
            timestamp: parse_log_time(&self.log_time)?,
        }))
    }
}

/// REST client for a Raiden-style channel node
pub struct RestChannelClient {
    client: reqwest::Client,
    base_url: String,
    node_address: String,
    chain_id: u64,
}

impl RestChannelClient {
    pub fn new(base_url: &str, node_address: &str, chain_id: u64, timeout: Duration) -> AppResult<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            node_address: node_address.to_lowercase(),
            chain_id,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/api/v1/{}", self.base_url, path)
    }

    async fn check(response: reqwest::Response) -> AppResult<reqwest::Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        Err(AppError::ExternalError(format!("Channel node returned {}: {}", status, body)))
    }
}

#[async_trait]
impl ChannelClient for RestChannelClient {
    fn node_address(&self) -> &str {
        &self.node_address
    }

    async fn list_channels(&self) -> AppResult<Vec<ChannelInfo>> {
        let response = self.client.get(self.url("channels")).send().await?;
        let channels: Vec<RestChannel> = Self::check(response).await?.json().await?;
        channels.into_iter().map(|c| c.into_info(self.chain_id)).collect()
    }

    async fn payments(&self, channel: &ChannelInfo, offset: usize) -> AppResult<Vec<ChannelPayment>> {
        let path = format!("payments/{}/{}", channel.token_address, channel.partner_address);
        let response = self.client.get(self.url(&path)).send().await?;
        let events: Vec<RestPaymentEvent> = Self::check(response).await?.json().await?;

        debug!("Channel {} reported {} payment events", channel.channel_id, events.len());

        let mut payments = Vec::new();
        for event in events {
            if let Some(payment) = event.into_payment(channel)? {
                payments.push(payment);
            }
        }
        Ok(payments.into_iter().skip(offset).collect())
    }

    async fn send_payment(
        &self,
        token_address: &str,
        target: &str,
        amount: Amount,
        identifier: u64,
    ) -> AppResult<ChannelPayment> {
        let path = format!("payments/{}/{}", token_address, target);
        let request = PaymentRequest {
            amount: amount.to_string(),
            identifier: identifier.to_string(),
        };
        let response = self.client.post(self.url(&path)).json(&request).send().await?;
        Self::check(response).await?;

        Ok(ChannelPayment {
            channel_id: String::new(),
            token_address: token_address.to_lowercase(),
            direction: PaymentDirection::Sent,
            counterparty: target.to_lowercase(),
            amount,
            identifier,
            timestamp: Utc::now(),
        })
    }

    async fn deposit(&self, channel: &ChannelInfo, total_deposit: Amount) -> AppResult<ChannelInfo> {
        let path = format!("channels/{}/{}", channel.token_address, channel.partner_address);
        let request = DepositRequest {
            total_deposit: total_deposit.to_string(),
        };
        let response = self.client.patch(self.url(&path)).json(&request).send().await?;
        let updated: RestChannel = Self::check(response).await?.json().await?;
        updated.into_info(self.chain_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn channel() -> ChannelInfo {
        ChannelInfo {
            channel_id: "7".into(),
            chain_id: 1,
            token_address: "0xtoken".into(),
            partner_address: "0xpartner".into(),
            balance: 100,
            total_deposit: 100,
            state: ChannelState::Opened,
        }
    }

    #[test]
    fn test_parse_channel() {
        let raw: RestChannel = serde_json::from_value(json!({
            "channel_identifier": "7",
            "token_address": "0xTOKEN",
            "partner_address": "0xPARTNER",
            "balance": "25",
            "total_deposit": "100",
            "state": "opened"
        }))
        .unwrap();

        let info = raw.into_info(1).unwrap();
        assert_eq!(info.token_address, "0xtoken");
        assert_eq!(info.balance, 25);
        assert!(info.is_open());
    }

    #[test]
    fn test_parse_payment_events() {
        let received: RestPaymentEvent = serde_json::from_value(json!({
            "event": "EventPaymentReceivedSuccess",
            "amount": "42",
            "identifier": "9001",
            "initiator": "0xPAYER",
            "log_time": "2024-03-01T10:00:00.123"
        }))
        .unwrap();
        let payment = received.into_payment(&channel()).unwrap().unwrap();
        assert_eq!(payment.direction, PaymentDirection::Received);
        assert_eq!(payment.counterparty, "0xpayer");
        assert_eq!(payment.identifier, 9001);
        assert_eq!(payment.amount, 42);

        let failed: RestPaymentEvent = serde_json::from_value(json!({
            "event": "EventPaymentSentFailed",
            "amount": "1",
            "identifier": "1",
            "log_time": "2024-03-01T10:00:00"
        }))
        .unwrap();
        assert!(failed.into_payment(&channel()).unwrap().is_none());
    }
}
