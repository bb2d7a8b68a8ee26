// =============================================================================
// Provider ticker -> Yahoo-compatible ticker mapping
// =============================================================================
//
// Providers ship exchange-local symbols; downstream resolution wants the
// Yahoo convention with an exchange suffix. The raw ticker is preserved on
// every holding before any of this runs.
// =============================================================================

/// Yahoo exchange suffix for a provider exchange label. US venues carry no
/// suffix.
pub fn yahoo_suffix(exchange: &str, location: &str) -> &'static str {
    if location == "Vereinigte Staaten"
        || location == "United States"
        || exchange.contains("NASDAQ")
        || exchange.contains("New York")
    {
        return "";
    }

    match exchange {
        "SIX Swiss Exchange" => ".SW",
        "Xetra" => ".DE",
        "London Stock Exchange" => ".L",
        "Euronext Amsterdam" => ".AS",
        "Nyse Euronext - Euronext Paris" => ".PA",
        "Nyse Euronext - Euronext Brussels" => ".BR",
        "Nyse Euronext - Euronext Lisbon" => ".LS",
        "Borsa Italiana" => ".MI",
        "Bolsa De Madrid" => ".MC",
        "Omx Nordic Exchange Copenhagen A/S" => ".CO",
        "Nasdaq Omx Helsinki Ltd." => ".HE",
        "Nasdaq Omx Nordic" => ".ST",
        "Tokyo Stock Exchange" => ".T",
        "Toronto Stock Exchange" => ".TO",
        "Hong Kong Exchanges And Clearing Ltd" => ".HK",
        "Asx - All Markets" => ".AX",
        "Singapore Exchange" => ".SI",
        "Oslo Bors Asa" => ".OL",
        "Wiener Boerse Ag" => ".VI",
        "Irish Stock Exchange - All Market" => ".IR",
        "Tel Aviv Stock Exchange" => ".TA",
        _ => "",
    }
}

/// Clean a provider ticker and attach the Yahoo suffix.
///
/// Handles the provider quirks observed in real files: UK trailing dots
/// (`RR.` -> `RR.L`), embedded spaces (`NOVO B` -> `NOVO-B`), Hong Kong
/// numeric tickers padded to four digits (`388` -> `0388.HK`), and internal
/// dots on Canadian/UK share classes (`GIB.A` -> `GIB-A.TO`).
pub fn to_yahoo_ticker(raw: &str, suffix: &str) -> String {
    let mut ticker = raw.trim().to_string();

    if suffix == ".L" && ticker.ends_with('.') {
        ticker.pop();
    }

    ticker = ticker.replace(' ', "-");

    if suffix == ".HK" && ticker.chars().all(|c| c.is_ascii_digit()) && ticker.len() < 4 {
        ticker = format!("{ticker:0>4}");
    }

    if (suffix == ".TO" || suffix == ".L") && ticker.contains('.') && !ticker.ends_with('.') {
        ticker = ticker.replace('.', "-");
    }

    if !suffix.is_empty() && !ticker.ends_with(suffix) {
        ticker.push_str(suffix);
    }

    ticker
}

/// Convenience: full mapping from provider exchange metadata to a Yahoo
/// ticker.
pub fn map_ticker(raw: &str, exchange: &str, location: &str) -> String {
    to_yahoo_ticker(raw, yahoo_suffix(exchange, location))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn us_venues_have_no_suffix() {
        assert_eq!(yahoo_suffix("NASDAQ", ""), "");
        assert_eq!(yahoo_suffix("New York Stock Exchange Inc.", ""), "");
        assert_eq!(yahoo_suffix("Xetra", "Vereinigte Staaten"), "");
    }

    #[test]
    fn european_suffixes() {
        assert_eq!(yahoo_suffix("Xetra", "Deutschland"), ".DE");
        assert_eq!(yahoo_suffix("London Stock Exchange", ""), ".L");
        assert_eq!(yahoo_suffix("SIX Swiss Exchange", ""), ".SW");
        assert_eq!(yahoo_suffix("Nyse Euronext - Euronext Paris", ""), ".PA");
        assert_eq!(yahoo_suffix("Euronext Amsterdam", ""), ".AS");
    }

    #[test]
    fn unknown_exchange_maps_to_no_suffix() {
        assert_eq!(yahoo_suffix("Bolsa Mexicana", ""), "");
    }

    #[test]
    fn uk_trailing_dot() {
        assert_eq!(to_yahoo_ticker("RR.", ".L"), "RR.L");
    }

    #[test]
    fn spaces_become_dashes() {
        assert_eq!(to_yahoo_ticker("NOVO B", ".CO"), "NOVO-B.CO");
    }

    #[test]
    fn hong_kong_numeric_padding() {
        assert_eq!(to_yahoo_ticker("388", ".HK"), "0388.HK");
        assert_eq!(to_yahoo_ticker("9988", ".HK"), "9988.HK");
    }

    #[test]
    fn share_class_dots_become_dashes() {
        assert_eq!(to_yahoo_ticker("GIB.A", ".TO"), "GIB-A.TO");
    }

    #[test]
    fn suffix_not_duplicated() {
        assert_eq!(to_yahoo_ticker("SAP.DE", ".DE"), "SAP.DE");
    }

    #[test]
    fn full_mapping() {
        assert_eq!(map_ticker("SAP", "Xetra", "Deutschland"), "SAP.DE");
        assert_eq!(map_ticker("AAPL", "NASDAQ", "United States"), "AAPL");
    }
}
