//! Structured channel descriptors and catalogue-driven discovery.
//!
//! Server-side channel names encode `kind-exchange--base--quote`
//! (e.g. `TRADE-GDAX--BTC--USD`). Everything inside the crate works
//! with `ChannelDescriptor`; the string form only exists at the wire.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use crate::util;

/// Message kind carried by a market channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ChannelKind {
    Order,
    Trade,
}

impl ChannelKind {
    pub const ALL: [ChannelKind; 2] = [ChannelKind::Order, ChannelKind::Trade];

    fn prefix(self) -> &'static str {
        match self {
            ChannelKind::Order => "ORDER",
            ChannelKind::Trade => "TRADE",
        }
    }

    /// Record shape used for messages on channels of this kind.
    pub fn response_type(self) -> &'static str {
        match self {
            ChannelKind::Order => "order",
            ChannelKind::Trade => "trade",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChannelDescriptor {
    pub kind: ChannelKind,
    pub exchange: String,
    pub base: String,
    pub quote: String,
}

impl ChannelDescriptor {
    pub fn new(kind: ChannelKind, exchange: &str, base: &str, quote: &str) -> Self {
        Self {
            kind,
            exchange: exchange.to_uppercase(),
            base: base.to_uppercase(),
            quote: quote.to_uppercase(),
        }
    }
}

impl fmt::Display for ChannelDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}-{}--{}--{}",
            self.kind.prefix(),
            self.exchange,
            self.base,
            self.quote
        )
    }
}

impl FromStr for ChannelDescriptor {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (prefix, rest) = s
            .split_once('-')
            .ok_or_else(|| format!("not a market channel: {s}"))?;
        let kind = ChannelKind::ALL
            .into_iter()
            .find(|k| k.prefix().eq_ignore_ascii_case(prefix))
            .ok_or_else(|| format!("unknown channel kind '{prefix}' in {s}"))?;

        let parts: Vec<&str> = rest.split("--").collect();
        match parts.as_slice() {
            [exchange, base, quote] if !exchange.is_empty() && !base.is_empty() && !quote.is_empty() => {
                Ok(ChannelDescriptor::new(kind, exchange, base, quote))
            }
            _ => Err(format!("malformed market channel: {s}")),
        }
    }
}

/// Subscription state per channel name: `true` once subscribed.
pub type ChannelTable = BTreeMap<String, bool>;

/// Every descriptor the configuration could possibly want.
///
/// exchanges × ordered pairs of distinct currencies × {order, trade}
pub fn candidates(exchanges: &[String], currencies: &[String]) -> Vec<ChannelDescriptor> {
    let pairs = util::currency_pairs(currencies);
    let mut out = Vec::new();
    for exchange in exchanges {
        for (base, quote) in &pairs {
            for kind in ChannelKind::ALL {
                out.push(ChannelDescriptor::new(kind, exchange, base, quote));
            }
        }
    }
    out
}

/// Intersects the server catalogue with the configured candidates and
/// records them in `table`.
///
/// Returns only channels not yet present in the table, each paired with
/// its response type. Calling it again with the same inputs returns
/// nothing.
pub fn discover(
    catalogue: &[String],
    exchanges: &[String],
    currencies: &[String],
    table: &mut ChannelTable,
) -> Vec<(ChannelDescriptor, &'static str)> {
    let mut fresh = Vec::new();
    for desc in candidates(exchanges, currencies) {
        let name = desc.to_string();
        if table.contains_key(&name) {
            continue;
        }
        if catalogue.iter().any(|c| c.eq_ignore_ascii_case(&name)) {
            table.insert(name, false);
            let rtype = desc.kind.response_type();
            fresh.push((desc, rtype));
        }
    }
    fresh
}
