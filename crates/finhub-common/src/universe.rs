//! Symbol universe loading
//!
//! The universe is a CSV dump of tradable stocks. The ticker is read from the
//! `symbol` column, or from the first column when the file has no such header.
//! Blank and `NULL` cells are skipped and duplicates are dropped, keeping the
//! first occurrence.

use crate::error::{FinhubError, Result};
use std::collections::HashSet;
use std::io::Read;
use std::path::Path;
use tracing::{debug, info};

const SYMBOL_COLUMN: &str = "symbol";
const EXCHANGE_COLUMN: &str = "exchange";

/// Options for reading a universe file.
#[derive(Debug, Clone, Default)]
pub struct UniverseFilter {
    /// Keep only rows whose `exchange` column matches (case-insensitive).
    pub exchange: Option<String>,
}

impl UniverseFilter {
    pub fn exchange(exchange: impl Into<String>) -> Self {
        Self {
            exchange: Some(exchange.into()),
        }
    }
}

/// Read the symbols listed in a CSV file.
///
/// Returns an error if the file is missing or yields no symbols.
pub fn load_symbols(path: impl AsRef<Path>, filter: &UniverseFilter) -> Result<Vec<String>> {
    let path = path.as_ref();
    let file = std::fs::File::open(path)?;
    let symbols = read_symbols(file, filter)?;

    if symbols.is_empty() {
        return Err(FinhubError::Parse(format!(
            "no symbols found in {}",
            path.display()
        )));
    }

    info!(path = %path.display(), count = symbols.len(), "Loaded symbol universe");
    Ok(symbols)
}

/// Read symbols from any CSV source. An empty result is not an error here.
pub fn read_symbols<R: Read>(source: R, filter: &UniverseFilter) -> Result<Vec<String>> {
    let mut reader = csv::ReaderBuilder::new()
        .trim(csv::Trim::All)
        .flexible(true)
        .from_reader(source);

    let headers = reader.headers()?.clone();
    let symbol_idx = headers
        .iter()
        .position(|h| h.eq_ignore_ascii_case(SYMBOL_COLUMN))
        .unwrap_or(0);
    let exchange_idx = headers
        .iter()
        .position(|h| h.eq_ignore_ascii_case(EXCHANGE_COLUMN));

    let wanted_exchange = match (&filter.exchange, exchange_idx) {
        (Some(exchange), Some(idx)) => Some((exchange.as_str(), idx)),
        (Some(exchange), None) => {
            return Err(FinhubError::Parse(format!(
                "cannot filter by exchange {exchange}: no '{EXCHANGE_COLUMN}' column"
            )));
        },
        (None, _) => None,
    };

    let mut seen = HashSet::new();
    let mut symbols = Vec::new();

    for record in reader.records() {
        let record = record?;

        if let Some((exchange, idx)) = wanted_exchange {
            let row_exchange = record.get(idx).unwrap_or_default();
            if !row_exchange.eq_ignore_ascii_case(exchange) {
                continue;
            }
        }

        let Some(symbol) = record.get(symbol_idx).filter(|s| is_present(s)) else {
            debug!(line = ?record.position().map(|p| p.line()), "Skipping row without symbol");
            continue;
        };

        if seen.insert(symbol.to_string()) {
            symbols.push(symbol.to_string());
        }
    }

    Ok(symbols)
}

fn is_present(cell: &str) -> bool {
    !cell.is_empty() && !cell.eq_ignore_ascii_case("null")
}
