// =============================================================================
// Holdings normalizer — turns messy provider tables into clean Holding rows
// =============================================================================
//
// Providers disagree on everything: column names, decimal separators,
// percentage vs decimal weights, footer rows, stray metadata lines above the
// header. Every table that enters the cache passes through here first, so
// downstream code only ever sees the canonical shape.
// =============================================================================

use std::path::Path;

use anyhow::{Context, Result};
use tracing::{debug, warn};

use crate::contracts::schemas::Holding;
use crate::isin::normalize_isin;
use crate::types::HoldingClass;

// =============================================================================
// Raw table
// =============================================================================

/// An untyped table as read from a provider file: lowercased headers plus
/// string cells.
#[derive(Debug, Clone, Default)]
pub struct RawTable {
    pub headers: Vec<String>,
    pub rows: Vec<Vec<String>>,
}

impl RawTable {
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    fn column(&self, name: &str) -> Option<usize> {
        self.headers.iter().position(|h| h == name)
    }
}

/// Read a CSV file into a raw table. Detects `;` delimited files (common in
/// German provider exports) by inspecting the header line.
pub fn read_csv_table(path: &Path) -> Result<RawTable> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read holdings file {}", path.display()))?;
    read_csv_str(&content)
}

pub fn read_csv_str(content: &str) -> Result<RawTable> {
    // Strip a UTF-8 BOM if present.
    let content = content.strip_prefix('\u{feff}').unwrap_or(content);

    let delimiter = detect_delimiter(content);
    let mut reader = csv::ReaderBuilder::new()
        .delimiter(delimiter)
        .flexible(true)
        .from_reader(content.as_bytes());

    let headers = reader
        .headers()
        .context("failed to read CSV headers")?
        .iter()
        .map(clean_header)
        .collect::<Vec<_>>();

    let mut rows = Vec::new();
    for record in reader.records() {
        let record = record.context("failed to read CSV record")?;
        rows.push(record.iter().map(|c| c.trim().to_string()).collect());
    }

    Ok(RawTable { headers, rows })
}

fn detect_delimiter(content: &str) -> u8 {
    let first_line = content.lines().next().unwrap_or("");
    if first_line.matches(';').count() > first_line.matches(',').count() {
        b';'
    } else {
        b','
    }
}

fn clean_header(raw: &str) -> String {
    raw.trim()
        .to_lowercase()
        .replace(['\n', '\r'], " ")
        .trim()
        .to_string()
}

// =============================================================================
// Column alias mapping
// =============================================================================

const WEIGHT_ALIASES: &[&str] = &[
    "weight_percentage",
    "weight",
    "% of holdings",
    "% of fund",
    "portfolio weight",
    "portfolio %",
    "allocation",
    "weighting",
    "gewichtung",
    "gewichtung (%)",
    "anteil",
    "poids",
    "% net assets",
    "net assets (%)",
    "market value (%)",
    "% market value",
];

const NAME_ALIASES: &[&str] = &[
    "name",
    "security name",
    "issuer",
    "issuer name",
    "holding name",
    "company",
    "company name",
    "bezeichnung",
    "titel",
    "security",
    "constituent name",
    "instrument name",
];

const ISIN_ALIASES: &[&str] = &["isin", "isin code", "isin-code", "security isin", "constituent isin"];

const TICKER_ALIASES: &[&str] = &[
    "ticker",
    "symbol",
    "exchange ticker",
    "bloomberg ticker",
    "trading symbol",
    "ticker symbol",
    "emittententicker",
];

const SECTOR_ALIASES: &[&str] = &["sector", "industry", "gics sector", "industry sector", "branche", "sektor"];

const COUNTRY_ALIASES: &[&str] = &[
    "country",
    "country of risk",
    "country of domicile",
    "location",
    "standort",
    "land",
    "pays",
];

/// Find the first header matching an alias, preferring exact matches over
/// substring matches so "weight" never shadows "weight_percentage".
fn find_column(headers: &[String], aliases: &[&str]) -> Option<usize> {
    for alias in aliases {
        if let Some(idx) = headers.iter().position(|h| h == alias) {
            return Some(idx);
        }
    }
    for alias in aliases {
        if let Some(idx) = headers.iter().position(|h| h.contains(alias)) {
            return Some(idx);
        }
    }
    None
}

// =============================================================================
// Number parsing
// =============================================================================

/// Parse a number in either German (1.234,56) or US (1,234.56) format,
/// tolerating percent signs, currency symbols, and placeholder strings.
pub fn parse_number(raw: &str) -> Option<f64> {
    let mut cleaned: String = raw
        .trim()
        .chars()
        .filter(|c| !matches!(c, '%' | '€' | '$' | '£' | '¥') && !c.is_whitespace())
        .collect();

    if cleaned.is_empty() {
        return None;
    }
    match cleaned.to_lowercase().as_str() {
        "-" | "n/a" | "nan" | "none" | "null" => return None,
        _ => {}
    }

    let has_comma = cleaned.contains(',');
    let has_dot = cleaned.contains('.');

    if has_comma && has_dot {
        let last_comma = cleaned.rfind(',').unwrap();
        let last_dot = cleaned.rfind('.').unwrap();
        if last_comma > last_dot {
            // German: 1.234,56
            cleaned = cleaned.replace('.', "").replace(',', ".");
        } else {
            // US: 1,234.56
            cleaned = cleaned.replace(',', "");
        }
    } else if has_comma {
        // Lone comma: decimal separator when followed by at most two digits,
        // thousands separator otherwise.
        let parts: Vec<&str> = cleaned.split(',').collect();
        if parts.len() == 2 && parts[1].len() <= 2 {
            cleaned = cleaned.replace(',', ".");
        } else {
            cleaned = cleaned.replace(',', "");
        }
    }

    cleaned.parse::<f64>().ok()
}

// =============================================================================
// Footer detection & classification
// =============================================================================

const FOOTER_PREFIXES: &[&str] = &["total", "sum", "cash", "other", "residual", "margin", "accrued"];

fn is_footer_row(name: &str) -> bool {
    let lower = name.trim().to_lowercase();
    FOOTER_PREFIXES.iter().any(|p| lower.starts_with(p))
}

const CURRENCY_TICKERS: &[&str] = &["USD", "EUR", "GBP", "CHF", "JPY", "CAD", "AUD", "HKD", "SEK", "DKK", "NOK"];

/// Classify a constituent by ticker and name. Anything not recognisably cash
/// or a derivative counts as equity.
pub fn classify_holding(ticker: &str, name: &str) -> HoldingClass {
    let name_upper = name.to_uppercase();
    let ticker_upper = ticker.trim().to_uppercase();

    if CURRENCY_TICKERS.contains(&ticker_upper.as_str())
        || name_upper.contains("CASH")
        || name_upper.contains("MONEY MARKET")
        || name_upper.contains("LIQUIDITY")
    {
        return HoldingClass::Cash;
    }

    if ["FUTURE", "FORWARD", "SWAP", "OPTION", "WARRANT", "CFD"]
        .iter()
        .any(|kw| name_upper.contains(kw))
    {
        return HoldingClass::Derivative;
    }

    HoldingClass::Equity
}

// =============================================================================
// Normalization
// =============================================================================

/// Normalize a raw provider table into canonical holdings.
///
/// Steps: fix a misplaced header row, map provider columns to canonical
/// names, parse weights (auto-detecting decimal format and scaling to
/// percentages), validate ISINs, drop footer and zero-weight rows, clamp
/// weights into [0, 150], classify, and sort by weight descending.
pub fn normalize_table(table: &RawTable, source_provider: &str) -> Vec<Holding> {
    if table.is_empty() {
        warn!(provider = source_provider, "empty holdings table provided to normalizer");
        return Vec::new();
    }

    let table = fix_header_row(table);

    let name_col = find_column(&table.headers, NAME_ALIASES);
    let weight_col = find_column(&table.headers, WEIGHT_ALIASES)
        .or_else(|| table.headers.iter().position(|h| h.contains("weight") || h.contains('%')));
    let isin_col = find_column(&table.headers, ISIN_ALIASES);
    let ticker_col = find_column(&table.headers, TICKER_ALIASES);
    let sector_col = find_column(&table.headers, SECTOR_ALIASES);
    let country_col = find_column(&table.headers, COUNTRY_ALIASES);
    let raw_ticker_col = table.column("raw_ticker");

    if weight_col.is_none() {
        warn!(provider = source_provider, "no weight column found in holdings table");
    }

    let cell = |row: &Vec<String>, col: Option<usize>| -> String {
        col.and_then(|i| row.get(i)).cloned().unwrap_or_default()
    };

    let mut holdings: Vec<Holding> = Vec::with_capacity(table.rows.len());
    for row in &table.rows {
        let name = cell(row, name_col);
        if name.is_empty() || is_footer_row(&name) {
            continue;
        }

        let weight = match parse_number(&cell(row, weight_col)) {
            Some(w) if w > 0.0 => w,
            _ => continue,
        };

        let ticker = cell(row, ticker_col);
        let mut holding = Holding::new(ticker.clone(), name.clone(), weight);
        let raw = cell(row, raw_ticker_col);
        if !raw.is_empty() {
            holding.raw_ticker = raw;
        }
        holding.isin = normalize_isin(&cell(row, isin_col));
        holding.asset_class = classify_holding(&ticker, &name);

        let sector = cell(row, sector_col);
        if !sector.is_empty() {
            holding.sector = sector;
        }
        let country = cell(row, country_col);
        if !country.is_empty() {
            holding.geography = country;
        }

        holdings.push(holding);
    }

    // Decimal-format detection: a table whose weights max out at 1.0 and sum
    // below 2.0 is in fractions, not percentages.
    let max_weight = holdings
        .iter()
        .map(|h| h.weight_percentage)
        .fold(0.0_f64, f64::max);
    let weight_sum: f64 = holdings.iter().map(|h| h.weight_percentage).sum();
    if !holdings.is_empty() && max_weight <= 1.0 && weight_sum <= 2.0 {
        debug!(
            provider = source_provider,
            weight_sum, "converted decimal weights to percentages"
        );
        for h in &mut holdings {
            h.weight_percentage *= 100.0;
        }
    }

    for h in &mut holdings {
        h.weight_percentage = h.weight_percentage.clamp(0.0, 150.0);
    }

    holdings.sort_by(|a, b| {
        b.weight_percentage
            .partial_cmp(&a.weight_percentage)
            .unwrap_or(std::cmp::Ordering::Equal)
    });

    debug!(
        provider = source_provider,
        rows_in = table.rows.len(),
        rows_out = holdings.len(),
        "holdings normalization complete"
    );

    holdings
}

/// Detect a header row hidden in the data: some providers prepend metadata
/// lines before the real header.
fn fix_header_row(table: &RawTable) -> RawTable {
    if table.rows.len() < 2 {
        return table.clone();
    }

    const HEADER_INDICATORS: &[&str] = &["name", "isin", "ticker", "weight", "security"];
    let first_row = &table.rows[0];
    let looks_like_header = first_row.iter().any(|cell| {
        let lower = cell.to_lowercase();
        HEADER_INDICATORS.iter().any(|ind| lower.contains(ind))
    });

    if looks_like_header {
        debug!("found header row in data, adjusting");
        RawTable {
            headers: first_row.iter().map(|c| clean_header(c)).collect(),
            rows: table.rows[1..].to_vec(),
        }
    } else {
        table.clone()
    }
}

/// Serialize normalized holdings back to the canonical cache CSV shape.
pub fn write_holdings_csv(path: &Path, holdings: &[Holding]) -> Result<()> {
    let mut writer = csv::Writer::from_path(path)
        .with_context(|| format!("failed to create {}", path.display()))?;

    writer.write_record([
        "ticker",
        "raw_ticker",
        "name",
        "weight_percentage",
        "isin",
        "sector",
        "country",
    ])?;
    for h in holdings {
        let weight = format!("{}", h.weight_percentage);
        writer.write_record([
            h.ticker.as_str(),
            h.raw_ticker.as_str(),
            h.name.as_str(),
            weight.as_str(),
            h.isin.as_deref().unwrap_or(""),
            h.sector.as_str(),
            h.geography.as_str(),
        ])?;
    }
    writer.flush().context("failed to flush holdings CSV")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn normalize_csv(content: &str) -> Vec<Holding> {
        let table = read_csv_str(content).unwrap();
        normalize_table(&table, "test")
    }

    #[test]
    fn parse_number_handles_us_and_german_formats() {
        assert_eq!(parse_number("1,234.56"), Some(1234.56));
        assert_eq!(parse_number("1.234,56"), Some(1234.56));
        assert_eq!(parse_number("3,25"), Some(3.25));
        assert_eq!(parse_number("1,234"), Some(1234.0));
        assert_eq!(parse_number("5.5%"), Some(5.5));
        assert_eq!(parse_number("€ 1.000,00"), Some(1000.0));
        assert_eq!(parse_number("N/A"), None);
        assert_eq!(parse_number("-"), None);
        assert_eq!(parse_number(""), None);
    }

    #[test]
    fn maps_provider_column_aliases() {
        let holdings = normalize_csv(
            "Issuer Name,Gewichtung (%),ISIN Code\n\
             Apple Inc.,\"5,25\",US0378331005\n\
             Microsoft Corp,4.80,US5949181045\n",
        );
        assert_eq!(holdings.len(), 2);
        assert_eq!(holdings[0].name, "Apple Inc.");
        assert_eq!(holdings[0].weight_percentage, 5.25);
        assert_eq!(holdings[0].isin.as_deref(), Some("US0378331005"));
    }

    #[test]
    fn scales_decimal_weights_to_percentages() {
        let holdings = normalize_csv(
            "name,weight\n\
             Apple Inc.,0.10\n\
             Microsoft Corp,0.05\n",
        );
        assert_eq!(holdings[0].weight_percentage, 10.0);
        assert_eq!(holdings[1].weight_percentage, 5.0);
    }

    #[test]
    fn does_not_scale_real_percentages() {
        let holdings = normalize_csv(
            "name,weight\n\
             Apple Inc.,10.0\n\
             Microsoft Corp,5.0\n",
        );
        assert_eq!(holdings[0].weight_percentage, 10.0);
    }

    #[test]
    fn removes_footer_and_summary_rows() {
        let holdings = normalize_csv(
            "name,weight\n\
             Apple Inc.,60.0\n\
             Total,100.0\n\
             Sum of holdings,100.0\n\
             Cash,5.0\n\
             Accrued income,0.2\n\
             Residual,0.1\n",
        );
        assert_eq!(holdings.len(), 1);
        assert_eq!(holdings[0].name, "Apple Inc.");
    }

    #[test]
    fn drops_rows_without_positive_weight() {
        let holdings = normalize_csv(
            "name,weight\n\
             Apple Inc.,10.0\n\
             Ghost Corp,\n\
             Negative Corp,-3.0\n",
        );
        assert_eq!(holdings.len(), 1);
    }

    #[test]
    fn invalid_isins_become_none() {
        let holdings = normalize_csv(
            "name,weight,isin\n\
             Apple Inc.,10.0,US0378331005\n\
             Oddball,5.0,NOT_AN_ISIN\n",
        );
        assert_eq!(holdings[0].isin.as_deref(), Some("US0378331005"));
        assert_eq!(holdings[1].isin, None);
    }

    #[test]
    fn detects_semicolon_delimiter() {
        let holdings = normalize_csv(
            "name;weight\n\
             Apple Inc.;10,5\n",
        );
        assert_eq!(holdings.len(), 1);
        assert_eq!(holdings[0].weight_percentage, 10.5);
    }

    #[test]
    fn recovers_header_hidden_in_data() {
        let holdings = normalize_csv(
            "col0,col1\n\
             Name,Weight\n\
             Apple Inc.,10.0\n",
        );
        assert_eq!(holdings.len(), 1);
        assert_eq!(holdings[0].name, "Apple Inc.");
    }

    #[test]
    fn classifies_cash_and_derivatives() {
        assert_eq!(classify_holding("USD", "USD Cash"), HoldingClass::Cash);
        assert_eq!(
            classify_holding("", "BlackRock Money Market Fund"),
            HoldingClass::Cash
        );
        assert_eq!(
            classify_holding("ESH5", "S&P 500 E-mini Future Mar 25"),
            HoldingClass::Derivative
        );
        assert_eq!(classify_holding("AAPL", "Apple Inc."), HoldingClass::Equity);
    }

    #[test]
    fn sorted_by_weight_descending() {
        let holdings = normalize_csv(
            "name,weight\n\
             Small,2.0\n\
             Big,50.0\n\
             Mid,10.0\n",
        );
        let names: Vec<_> = holdings.iter().map(|h| h.name.as_str()).collect();
        assert_eq!(names, vec!["Big", "Mid", "Small"]);
    }

    #[test]
    fn roundtrip_write_then_normalize_is_stable() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("IE00B4L5Y983.csv");

        let original = normalize_csv(
            "name,weight,isin,ticker\n\
             Apple Inc.,10.0,US0378331005,AAPL\n\
             Microsoft Corp,5.0,US5949181045,MSFT\n",
        );
        write_holdings_csv(&path, &original).unwrap();

        let reread = normalize_table(&read_csv_table(&path).unwrap(), "roundtrip");
        assert_eq!(reread.len(), original.len());
        for (a, b) in original.iter().zip(reread.iter()) {
            assert_eq!(a.name, b.name);
            assert_eq!(a.isin, b.isin);
            assert_eq!(a.ticker, b.ticker);
            assert!((a.weight_percentage - b.weight_percentage).abs() < 1e-9);
        }
    }
}
