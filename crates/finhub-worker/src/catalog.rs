//! Finnhub handler catalog
//!
//! The static table of handlers registered at startup. Each entry names the
//! upstream endpoint, the normalizer that shapes its response into rows, and
//! the table those rows land in. Table definitions live in `migrations/`.

use crate::error::RegistryError;
use crate::fetch::{EndpointFetcher, Fetcher, FinnhubClient};
use crate::normalize::Normalizer;
use crate::registry::{DateWindow, TaskDescriptor, TaskDescriptorBuilder, TaskRegistry};
use crate::schema::{ColumnType, SchemaDescriptor};
use std::sync::Arc;

/// Every handler key the catalog registers, with its upstream endpoint.
pub const HANDLERS: &[(&str, &str)] = &[
    ("company_profile", "stock/profile"),
    ("company_profile2", "stock/profile2"),
    ("company_peers", "stock/peers"),
    ("company_news", "company-news"),
    ("recommendation_trends", "stock/recommendation"),
    ("price_target", "stock/price-target"),
    ("revenue_estimate", "stock/revenue-estimate"),
    ("eps_estimate", "stock/eps-estimate"),
    ("ebitda_estimate", "stock/ebitda-estimate"),
    ("ebit_estimate", "stock/ebit-estimate"),
    ("earnings_data", "stock/earnings"),
    ("earnings_calendar", "calendar/earnings"),
    ("dividend", "stock/dividend"),
    ("stock_split", "stock/split"),
    ("realtime_quote", "quote"),
    ("candlestick_data", "stock/candle"),
    ("insider_transaction", "stock/insider-transactions"),
    ("earnings_quality_score", "stock/earnings-quality-score"),
];

/// Registry backed by live Finnhub endpoints.
pub fn finnhub_registry(client: Arc<FinnhubClient>) -> Result<TaskRegistry, RegistryError> {
    build_registry(|endpoint| -> Arc<dyn Fetcher> {
        Arc::new(EndpointFetcher::new(Arc::clone(&client), endpoint))
    })
}

/// Registry whose fetchers come from `fetcher_for(endpoint)`.
pub fn build_registry<F>(fetcher_for: F) -> Result<TaskRegistry, RegistryError>
where
    F: Fn(&str) -> Arc<dyn Fetcher>,
{
    let mut registry = TaskRegistry::new();
    for &(key, endpoint) in HANDLERS {
        let builder = TaskDescriptor::builder(key, fetcher_for(endpoint), schema_for(key)?);
        registry.register(configure(key, builder).build())?;
    }
    Ok(registry)
}

fn configure(key: &str, builder: TaskDescriptorBuilder) -> TaskDescriptorBuilder {
    match key {
        "company_profile" | "company_profile2" => builder.normalizer(
            Normalizer::new().no_envelope().inject_subject("ticker"),
        ),
        "company_peers" => builder.normalizer(
            Normalizer::new()
                .no_envelope()
                .scalars("peer")
                .inject_subject("symbol"),
        ),
        "company_news" => builder
            .date_window(DateWindow::days(7))
            .normalizer(Normalizer::new().inject_subject("symbol")),
        "recommendation_trends" | "earnings_data" => {
            builder.normalizer(Normalizer::new().inject_subject("symbol"))
        },
        "price_target" => builder.normalizer(
            Normalizer::new().no_envelope().inject_subject("symbol"),
        ),
        "revenue_estimate" | "eps_estimate" | "ebitda_estimate" | "ebit_estimate" => builder
            .default_param("freq", "quarterly")
            .normalizer(
                Normalizer::new()
                    .inject_subject("symbol")
                    .inject_param("freq", "freq"),
            ),
        "earnings_calendar" => builder.date_window(DateWindow::days(30)).normalizer(
            Normalizer::new()
                .envelope("earningsCalendar")
                .inject_subject("symbol"),
        ),
        "dividend" => builder
            .date_window(DateWindow::days(365))
            .normalizer(Normalizer::new().inject_subject("symbol")),
        "stock_split" => builder
            .date_window(DateWindow::days(3650))
            .normalizer(Normalizer::new().inject_subject("symbol")),
        "realtime_quote" => builder.normalizer(
            Normalizer::new().no_envelope().inject_subject("symbol"),
        ),
        "candlestick_data" => builder
            .default_param("resolution", "D")
            .date_window(DateWindow::days(30).unix_seconds())
            .normalizer(
                Normalizer::new()
                    .no_envelope()
                    .columnar(
                        Some("s"),
                        [
                            ("t", "t"),
                            ("o", "open"),
                            ("h", "high"),
                            ("l", "low"),
                            ("c", "close"),
                            ("v", "volume"),
                        ],
                    )
                    .inject_subject("symbol")
                    .inject_param("resolution", "resolution"),
            ),
        "insider_transaction" => {
            builder.normalizer(Normalizer::new().inject_subject("symbol"))
        },
        "earnings_quality_score" => builder.default_param("freq", "quarterly").normalizer(
            Normalizer::new()
                .inject_subject("symbol")
                .inject_param("freq", "freq"),
        ),
        _ => builder,
    }
}

fn schema_for(key: &str) -> Result<SchemaDescriptor, RegistryError> {
    use ColumnType::{BigInt, Double, Text};

    let schema = match key {
        "company_profile" => SchemaDescriptor::builder("company_profiles")
            .text("ticker")
            .text("name")
            .text("address")
            .text("city")
            .text("state")
            .text("country")
            .text("currency")
            .text("exchange")
            .text("ipo")
            .column_from("market_capitalization", "marketCapitalization", Double)
            .column_from("share_outstanding", "shareOutstanding", Double)
            .column_from("employee_total", "employeeTotal", BigInt)
            .text("isin")
            .text("cusip")
            .column_from("finnhub_industry", "finnhubIndustry", Text)
            .text("weburl")
            .key(["ticker"]),
        "company_profile2" => SchemaDescriptor::builder("company_profiles_v2")
            .text("ticker")
            .text("name")
            .text("country")
            .text("currency")
            .text("exchange")
            .text("ipo")
            .column_from("market_capitalization", "marketCapitalization", Double)
            .column_from("share_outstanding", "shareOutstanding", Double)
            .text("phone")
            .text("weburl")
            .text("logo")
            .column_from("finnhub_industry", "finnhubIndustry", Text)
            .key(["ticker"]),
        "company_peers" => SchemaDescriptor::builder("company_peers")
            .text("symbol")
            .text("peer")
            .key(["symbol", "peer"]),
        "company_news" => SchemaDescriptor::builder("company_news")
            .text("symbol")
            .bigint("datetime")
            .bigint("id")
            .text("category")
            .text("headline")
            .text("image")
            .text("related")
            .text("source")
            .text("summary")
            .text("url")
            .key(["symbol", "datetime", "id"]),
        "recommendation_trends" => SchemaDescriptor::builder("recommendation_trends")
            .text("symbol")
            .text("period")
            .bigint("buy")
            .bigint("hold")
            .bigint("sell")
            .column_from("strong_buy", "strongBuy", BigInt)
            .column_from("strong_sell", "strongSell", BigInt)
            .key(["symbol", "period"]),
        "price_target" => SchemaDescriptor::builder("price_targets")
            .text("symbol")
            .column_from("last_updated", "lastUpdated", Text)
            .column_from("number_analysts", "numberAnalysts", BigInt)
            .column_from("target_high", "targetHigh", Double)
            .column_from("target_low", "targetLow", Double)
            .column_from("target_mean", "targetMean", Double)
            .column_from("target_median", "targetMedian", Double)
            .key(["symbol", "last_updated"]),
        "revenue_estimate" => estimate_schema("revenue_estimates", "revenue"),
        "eps_estimate" => estimate_schema("eps_estimates", "eps"),
        "ebitda_estimate" => estimate_schema("ebitda_estimates", "ebitda"),
        "ebit_estimate" => estimate_schema("ebit_estimates", "ebit"),
        "earnings_data" => SchemaDescriptor::builder("earnings_data")
            .text("symbol")
            .text("period")
            .double("actual")
            .double("estimate")
            .double("surprise")
            .column_from("surprise_percent", "surprisePercent", Double)
            .bigint("quarter")
            .bigint("year")
            .key(["symbol", "period"]),
        "earnings_calendar" => SchemaDescriptor::builder("earnings_calendar")
            .text("symbol")
            .text("date")
            .text("hour")
            .bigint("quarter")
            .bigint("year")
            .column_from("eps_actual", "epsActual", Double)
            .column_from("eps_estimate", "epsEstimate", Double)
            .column_from("revenue_actual", "revenueActual", Double)
            .column_from("revenue_estimate", "revenueEstimate", Double)
            .key(["symbol", "date"]),
        "dividend" => SchemaDescriptor::builder("dividends")
            .text("symbol")
            .text("date")
            .double("amount")
            .column_from("adjusted_amount", "adjustedAmount", Double)
            .text("currency")
            .column_from("declaration_date", "declarationDate", Text)
            .column_from("pay_date", "payDate", Text)
            .column_from("record_date", "recordDate", Text)
            .key(["symbol", "date"]),
        "stock_split" => SchemaDescriptor::builder("stock_splits")
            .text("symbol")
            .text("date")
            .column_from("from_factor", "fromFactor", Double)
            .column_from("to_factor", "toFactor", Double)
            .key(["symbol", "date"]),
        "realtime_quote" => SchemaDescriptor::builder("stock_quotes")
            .text("symbol")
            .bigint("t")
            .column_from("current_price", "c", Double)
            .column_from("change", "d", Double)
            .column_from("percent_change", "dp", Double)
            .column_from("high", "h", Double)
            .column_from("low", "l", Double)
            .column_from("open", "o", Double)
            .column_from("previous_close", "pc", Double)
            .key(["symbol", "t"]),
        "candlestick_data" => SchemaDescriptor::builder("stock_candles")
            .text("symbol")
            .text("resolution")
            .bigint("t")
            .double("open")
            .double("high")
            .double("low")
            .double("close")
            .double("volume")
            .key(["symbol", "resolution", "t"]),
        "insider_transaction" => SchemaDescriptor::builder("insider_transactions")
            .text("symbol")
            .text("name")
            .column_from("filing_date", "filingDate", Text)
            .column_from("transaction_date", "transactionDate", Text)
            .text("id")
            .double("share")
            .double("change")
            .column_from("transaction_code", "transactionCode", Text)
            .column_from("transaction_price", "transactionPrice", Double)
            .key(["symbol", "name", "filing_date", "transaction_date"]),
        "earnings_quality_score" => SchemaDescriptor::builder("earnings_quality_scores")
            .text("symbol")
            .text("period")
            .text("freq")
            .double("score")
            .column_from("letter_score", "letterScore", Text)
            .key(["symbol", "period", "freq"]),
        other => return Err(RegistryError::UnknownHandler(other.to_string())),
    };
    schema.build()
}

/// Analyst estimates share one layout, prefixed by the metric name.
fn estimate_schema(table: &str, metric: &str) -> crate::schema::SchemaBuilder {
    let camel = |suffix: &str| format!("{metric}{suffix}");
    SchemaDescriptor::builder(table)
        .text("symbol")
        .text("period")
        .text("freq")
        .column_from(format!("{metric}_avg"), camel("Avg"), ColumnType::Double)
        .column_from(format!("{metric}_high"), camel("High"), ColumnType::Double)
        .column_from(format!("{metric}_low"), camel("Low"), ColumnType::Double)
        .column_from("number_analysts", "numberAnalysts", ColumnType::BigInt)
        .bigint("quarter")
        .bigint("year")
        .key(["symbol", "period", "freq"])
}
