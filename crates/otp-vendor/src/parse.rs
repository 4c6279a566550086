//! Parsers for the `handler_api` text protocol.
//!
//! Successful answers are `TOKEN` or `TOKEN:field:field`; failures are a bare
//! upper-case token such as `NO_BALANCE`.

use serde::Deserialize;

use otp_core::{
    domain::OrderId,
    errors::Error,
    ports::{StatusReply, TerminalReason},
    Result,
};

/// One purchasable service (`tg`, `wa`, ...).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Service {
    pub code: String,
    pub name: String,
}

/// A freshly rented number.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Rental {
    pub order_id: OrderId,
    pub phone: String,
    pub price: String,
}

pub fn parse_balance(raw: &str) -> Result<f64> {
    let raw = raw.trim();
    let Some(amount) = raw.strip_prefix("ACCESS_BALANCE:") else {
        return Err(vendor_error(raw));
    };
    amount
        .trim()
        .parse::<f64>()
        .map_err(|_| Error::External(format!("unparseable balance: {amount:?}")))
}

/// `code:name` per line. Lines without a colon are skipped.
pub fn parse_services(raw: &str) -> Result<Vec<Service>> {
    let raw = raw.trim();
    if is_error_token(raw) {
        return Err(vendor_error(raw));
    }
    Ok(raw
        .lines()
        .filter_map(|line| line.split_once(':'))
        .map(|(code, name)| Service {
            code: code.trim().to_string(),
            name: name.trim().to_string(),
        })
        .filter(|s| !s.code.is_empty())
        .collect())
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RentalJson {
    activation_id: serde_json::Value,
    phone_number: serde_json::Value,
    #[serde(default)]
    activation_cost: Option<serde_json::Value>,
}

/// `ACCESS_NUMBER:<id>:<phone>[:<price>]`, or the JSON shape some mirrors return.
pub fn parse_rental(raw: &str) -> Result<Rental> {
    let raw = raw.trim();

    if raw.starts_with('{') {
        let v: RentalJson = serde_json::from_str(raw)?;
        return Ok(Rental {
            order_id: OrderId(json_scalar(&v.activation_id)),
            phone: json_scalar(&v.phone_number),
            price: v
                .activation_cost
                .as_ref()
                .map(json_scalar)
                .unwrap_or_else(|| "?".to_string()),
        });
    }

    let Some(rest) = raw.strip_prefix("ACCESS_NUMBER:") else {
        return Err(vendor_error(raw));
    };
    let mut parts = rest.split(':');
    let (Some(id), Some(phone)) = (parts.next(), parts.next()) else {
        return Err(Error::External(format!("malformed rental reply: {raw:?}")));
    };
    if id.is_empty() || phone.is_empty() {
        return Err(Error::External(format!("malformed rental reply: {raw:?}")));
    }
    Ok(Rental {
        order_id: OrderId(id.to_string()),
        phone: phone.to_string(),
        price: parts
            .next()
            .filter(|p| !p.is_empty())
            .unwrap_or("?")
            .to_string(),
    })
}

/// Map a raw `getStatus` answer onto the watcher's reply variants.
pub fn classify_status(raw: &str) -> StatusReply {
    let raw = raw.trim();

    if let Some(code) = raw.strip_prefix("STATUS_OK:") {
        let code = code.trim();
        if code.is_empty() {
            return StatusReply::TransientError {
                message: "STATUS_OK without a code".to_string(),
            };
        }
        return StatusReply::CodeReady {
            code: code.to_string(),
            phone: None,
        };
    }
    if raw.starts_with("STATUS_CANCEL") || raw.starts_with("STATUS_FINISH") {
        return StatusReply::TerminalNegative(TerminalReason::Cancelled);
    }
    if raw.starts_with("NO_ACTIVATION") {
        return StatusReply::TerminalNegative(TerminalReason::NotFound);
    }
    if raw.starts_with("STATUS_WAIT_") {
        return StatusReply::Pending;
    }

    StatusReply::TransientError {
        message: format!("unexpected status reply: {}", preview(raw)),
    }
}

/// `setStatus` accepted tokens.
pub fn expect_token(raw: &str, accepted: &[&str]) -> Result<()> {
    let raw = raw.trim();
    if accepted.iter().any(|t| raw.starts_with(t)) {
        return Ok(());
    }
    Err(vendor_error(raw))
}

fn is_error_token(raw: &str) -> bool {
    !raw.is_empty()
        && raw
            .chars()
            .all(|c| c.is_ascii_uppercase() || c.is_ascii_digit() || c == '_')
        && !raw.starts_with("ACCESS_")
}

fn vendor_error(raw: &str) -> Error {
    if is_error_token(raw) {
        Error::Vendor {
            code: raw.to_string(),
        }
    } else {
        Error::External(format!("unexpected vendor reply: {}", preview(raw)))
    }
}

fn json_scalar(v: &serde_json::Value) -> String {
    match v {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn preview(raw: &str) -> String {
    raw.chars().take(80).collect()
}
