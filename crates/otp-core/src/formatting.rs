//! HTML-safe message text for everything the bot tells a user.
//!
//! Telegram HTML parse mode only needs `&`, `<` and `>` escaped.

use crate::{domain::OrderId, errors::Error, ports::TerminalReason};

pub fn escape_html(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            _ => out.push(c),
        }
    }
    out
}

pub fn code_received(code: &str, phone: &str) -> String {
    format!(
        "🎉 <b>OTP RECEIVED!</b>\n\n🔑 Code: <code>{}</code>\n📱 Number: <code>{}</code>",
        escape_html(code),
        escape_html(phone)
    )
}

pub fn order_terminated(order_id: &OrderId, reason: TerminalReason) -> String {
    let what = match reason {
        TerminalReason::Cancelled => "has ended or was cancelled",
        TerminalReason::NotFound => "no longer exists or has expired",
    };
    format!("Order <code>{}</code> {what}.", escape_html(&order_id.0))
}

pub fn connection_slow() -> String {
    "⏱️ Connection to the number service is slow, still retrying...".to_string()
}

pub fn check_manually(order_id: &OrderId) -> String {
    format!(
        "⚠️ Could not reach the number service for order <code>{}</code>.\n\
         Please check it manually in a moment.",
        escape_html(&order_id.0)
    )
}

pub fn timed_out(waited_secs: u64) -> String {
    format!(
        "⏰ No OTP received after ~{waited_secs}s.\n\
         You can still check the order manually."
    )
}

pub fn order_rented(order_id: &OrderId, phone: &str, price: &str) -> String {
    format!(
        "✅ <b>NUMBER RENTED</b>\n\n📱 Number: <code>{}</code>\n🆔 ID: <code>{}</code>\n💰 Price: {}\n\n⏳ Waiting for the OTP automatically...",
        escape_html(phone),
        escape_html(&order_id.0),
        escape_html(price)
    )
}

/// Map an error to the fixed message a user is allowed to see.
///
/// Never includes vendor bodies or internal detail.
pub fn user_error(err: &Error) -> &'static str {
    match err {
        Error::Transient(msg) if msg.contains("timed out") || msg.contains("timeout") => {
            "⏱️ Connection is slow, please try again!"
        }
        Error::Transient(msg) if msg.contains("429") => {
            "Too many requests, please wait a minute."
        }
        Error::Transient(msg) if msg.contains("connect") => {
            "🔌 Could not connect to the number service!"
        }
        Error::Transient(_) => "❌ The number service returned a server error.",
        Error::Vendor { code } if code == "NO_BALANCE" => "💸 Not enough balance.",
        Error::Vendor { code } if code == "NO_NUMBERS" => {
            "📵 No numbers available for this service right now."
        }
        Error::Vendor { .. } => "⚠️ The service is busy, try again in a few seconds.",
        Error::OrderInProgress { .. } => {
            "⚠️ You already have an order waiting for an OTP. Wait for it or cancel it first."
        }
        _ => "❌ Something went wrong. Please try again or contact the admin!",
    }
}
