//! Hyperliquid wire codec: the one upstream venue this system speaks
//! to. The teacher's per-exchange `ExchangeAdapter` trait collapses to
//! a single module here (see DESIGN.md) since there is exactly one
//! venue; the subscribe-frame / parse split the teacher's adapters
//! perform is kept.

use crate::error::{MonitorError, Result};
use crate::schema::{
    Address, Fill, FuturesPosition, OrderStatus, OrderStatusEvent, PositionSnapshot, Side,
    SpotBalance, SubscriptionEvent,
};
use rust_decimal::Decimal;
use serde_json::Value;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HlChannel {
    UserFills,
    OrderUpdates,
    WebData2,
}

impl HlChannel {
    fn wire_name(self) -> &'static str {
        match self {
            HlChannel::UserFills => "userFills",
            HlChannel::OrderUpdates => "orderUpdates",
            HlChannel::WebData2 => "webData2",
        }
    }
}

/// Builds the `{address, type}`-shaped subscribe frame spec.md §6
/// names, for one logical channel.
pub fn build_subscribe_frame(channel: HlChannel, address: &Address) -> Value {
    serde_json::json!({
        "method": "subscribe",
        "subscription": {
            "type": channel.wire_name(),
            "user": address.0,
        }
    })
}

pub fn build_unsubscribe_frame(channel: HlChannel, address: &Address) -> Value {
    serde_json::json!({
        "method": "unsubscribe",
        "subscription": {
            "type": channel.wire_name(),
            "user": address.0,
        }
    })
}

fn dec_from_str(v: &Value) -> Decimal {
    v.as_str()
        .and_then(|s| Decimal::from_str(s).ok())
        .or_else(|| v.as_f64().and_then(Decimal::from_f64_retain))
        .unwrap_or(Decimal::ZERO)
}

/// Hyperliquid fill sides arrive as `"B"` (bid/long) or `"A"` (ask/short).
fn side_from_str(s: &str) -> Side {
    if s == "B" || s.eq_ignore_ascii_case("long") {
        Side::Long
    } else {
        Side::Short
    }
}

/// Parses one inbound text frame. Returns `None` for control frames
/// (subscription acks, pongs) the caller can safely ignore; never
/// panics on malformed input — a shape violation becomes
/// `MonitorError::MalformedEvent` so the caller can log+drop+count it
/// per spec.md §7.
pub fn parse_message(raw: &str) -> Result<Option<(Address, SubscriptionEvent)>> {
    let v: Value =
        serde_json::from_str(raw).map_err(|e| MonitorError::malformed(e.to_string(), raw))?;

    let channel = match v.get("channel").and_then(Value::as_str) {
        Some(c) => c,
        None => return Ok(None),
    };

    match channel {
        "userFills" => parse_user_fills(&v, raw),
        "orderUpdates" => parse_order_updates(&v, raw),
        "webData2" => parse_position(&v, raw),
        "pong" | "subscriptionResponse" | "error" => Ok(None),
        _ => Ok(None),
    }
}

fn parse_user_fills(v: &Value, raw: &str) -> Result<Option<(Address, SubscriptionEvent)>> {
    let data = v
        .get("data")
        .ok_or_else(|| MonitorError::malformed("userFills missing data", raw))?;
    let user = data
        .get("user")
        .and_then(Value::as_str)
        .ok_or_else(|| MonitorError::malformed("userFills missing user", raw))?;
    let address =
        Address::new(user).ok_or_else(|| MonitorError::malformed("invalid address in userFills", raw))?;

    let fills_raw = data
        .get("fills")
        .and_then(Value::as_array)
        .ok_or_else(|| MonitorError::malformed("userFills missing fills array", raw))?;

    let mut fills = Vec::with_capacity(fills_raw.len());
    for f in fills_raw {
        let oid = f
            .get("oid")
            .and_then(Value::as_i64)
            .ok_or_else(|| MonitorError::malformed("fill missing oid", raw))?;
        let tid = f
            .get("tid")
            .and_then(Value::as_i64)
            .ok_or_else(|| MonitorError::malformed("fill missing tid", raw))?;
        let coin = f
            .get("coin")
            .and_then(Value::as_str)
            .ok_or_else(|| MonitorError::malformed("fill missing coin", raw))?
            .to_string();
        let side = side_from_str(f.get("side").and_then(Value::as_str).unwrap_or("B"));
        let px = dec_from_str(f.get("px").unwrap_or(&Value::Null));
        let sz = dec_from_str(f.get("sz").unwrap_or(&Value::Null));
        let time = f.get("time").and_then(Value::as_i64).unwrap_or_else(crate::util::now_ms);
        let crossed = f.get("crossed").and_then(Value::as_bool).unwrap_or(false);

        fills.push(Fill {
            address: address.clone(),
            oid,
            tid,
            coin,
            side,
            px,
            sz,
            time,
            crossed,
        });
    }

    Ok(Some((address, SubscriptionEvent::Fills(fills))))
}

fn parse_order_updates(v: &Value, raw: &str) -> Result<Option<(Address, SubscriptionEvent)>> {
    let data = v
        .get("data")
        .and_then(Value::as_array)
        .ok_or_else(|| MonitorError::malformed("orderUpdates missing data array", raw))?;

    let mut address: Option<Address> = None;
    let mut statuses = Vec::with_capacity(data.len());

    for item in data {
        let order = item
            .get("order")
            .ok_or_else(|| MonitorError::malformed("order update missing order", raw))?;
        let user = order
            .get("user")
            .and_then(Value::as_str)
            .ok_or_else(|| MonitorError::malformed("order update missing user", raw))?;
        let addr = Address::new(user)
            .ok_or_else(|| MonitorError::malformed("invalid address in orderUpdates", raw))?;
        let oid = order
            .get("oid")
            .and_then(Value::as_i64)
            .ok_or_else(|| MonitorError::malformed("order update missing oid", raw))?;
        let status_str = item.get("status").and_then(Value::as_str).unwrap_or("pending");
        let status = match status_str {
            "filled" => OrderStatus::Filled,
            "canceled" | "cancelled" => OrderStatus::Canceled,
            "rejected" => OrderStatus::Rejected,
            _ => OrderStatus::Pending,
        };
        let time = item
            .get("statusTimestamp")
            .and_then(Value::as_i64)
            .unwrap_or_else(crate::util::now_ms);

        address.get_or_insert_with(|| addr.clone());
        statuses.push(OrderStatusEvent {
            address: addr,
            oid,
            status,
            time,
        });
    }

    let address = address.ok_or_else(|| MonitorError::malformed("orderUpdates had no entries", raw))?;
    Ok(Some((address, SubscriptionEvent::OrderStatuses(statuses))))
}

fn parse_position(v: &Value, raw: &str) -> Result<Option<(Address, SubscriptionEvent)>> {
    let data = v
        .get("data")
        .ok_or_else(|| MonitorError::malformed("webData2 missing data", raw))?;
    let user = data
        .get("user")
        .and_then(Value::as_str)
        .ok_or_else(|| MonitorError::malformed("webData2 missing user", raw))?;
    let address =
        Address::new(user).ok_or_else(|| MonitorError::malformed("invalid address in webData2", raw))?;

    let clearinghouse = data.get("clearinghouseState").unwrap_or(&Value::Null);
    let margin_summary = clearinghouse.get("marginSummary").unwrap_or(&Value::Null);
    let account_value = dec_from_str(margin_summary.get("accountValue").unwrap_or(&Value::Null));
    let total_margin_used = dec_from_str(margin_summary.get("totalMarginUsed").unwrap_or(&Value::Null));
    let total_ntl_pos = dec_from_str(margin_summary.get("totalNtlPos").unwrap_or(&Value::Null));
    let withdrawable = dec_from_str(clearinghouse.get("withdrawable").unwrap_or(&Value::Null));

    let spot_total_usd = dec_from_str(data.get("spotTotalUsd").unwrap_or(&Value::Null));
    let spot_balances = data
        .get("spotBalances")
        .and_then(Value::as_array)
        .map(|arr| {
            arr.iter()
                .map(|b| SpotBalance {
                    asset: b.get("coin").and_then(Value::as_str).unwrap_or_default().to_string(),
                    total: dec_from_str(b.get("total").unwrap_or(&Value::Null)),
                })
                .collect()
        })
        .unwrap_or_default();

    let futures_positions = clearinghouse
        .get("assetPositions")
        .and_then(Value::as_array)
        .map(|arr| {
            arr.iter()
                .filter_map(|p| {
                    let pos = p.get("position")?;
                    let szi = dec_from_str(pos.get("szi").unwrap_or(&Value::Null));
                    Some(FuturesPosition {
                        symbol: pos.get("coin").and_then(Value::as_str).unwrap_or_default().to_string(),
                        side: if szi.is_sign_negative() { Side::Short } else { Side::Long },
                        size: szi.abs(),
                        entry_px: dec_from_str(pos.get("entryPx").unwrap_or(&Value::Null)),
                    })
                })
                .collect()
        })
        .unwrap_or_default();

    Ok(Some((
        address.clone(),
        SubscriptionEvent::Position(PositionSnapshot {
            address,
            spot_total_usd,
            account_value,
            spot_balances,
            futures_positions,
            total_margin_used,
            total_ntl_pos,
            withdrawable,
            updated_at: crate::util::now_ms(),
        }),
    )))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builds_subscribe_frame() {
        let addr = Address::new("0x1234567890123456789012345678901234567890").unwrap();
        let frame = build_subscribe_frame(HlChannel::UserFills, &addr);
        assert_eq!(frame["method"], "subscribe");
        assert_eq!(frame["subscription"]["type"], "userFills");
        assert_eq!(frame["subscription"]["user"], addr.0);
    }

    #[test]
    fn parses_user_fills() {
        let raw = serde_json::json!({
            "channel": "userFills",
            "data": {
                "user": "0x1234567890123456789012345678901234567890",
                "fills": [
                    {"oid": 1, "tid": 10, "coin": "BTC", "side": "B", "px": "100", "sz": "2", "time": 1000, "crossed": true}
                ]
            }
        })
        .to_string();

        let (address, event) = parse_message(&raw).unwrap().unwrap();
        assert_eq!(address.0, "0x1234567890123456789012345678901234567890");
        match event {
            SubscriptionEvent::Fills(fills) => {
                assert_eq!(fills.len(), 1);
                assert_eq!(fills[0].oid, 1);
                assert_eq!(fills[0].tid, 10);
            }
            _ => panic!("expected Fills"),
        }
    }

    #[test]
    fn malformed_json_is_an_error_not_a_panic() {
        let err = parse_message("not json").unwrap_err();
        matches!(err, MonitorError::MalformedEvent { .. });
    }

    #[test]
    fn unknown_channel_is_control() {
        let raw = serde_json::json!({"channel": "pong"}).to_string();
        assert!(parse_message(&raw).unwrap().is_none());
    }
}
