// Per-broker page knowledge: how to recognise its tab and where its UI
// keeps the instrument name, the payout and the asset picker.

use crate::market_data::adapters::BrokerVariant;

#[derive(Debug)]
pub struct BrokerProfile {
    pub variant: BrokerVariant,
    /// Lowercase fragments of the tab URL or title.
    pub match_tokens: &'static [&'static str],
    /// Tried in order; first non-empty text wins.
    pub asset_name_selectors: &'static [&'static str],
    /// Displayed name carries trailing noise after the first word.
    pub asset_name_first_word: bool,
    pub payout_selectors: &'static [&'static str],
    pub picker_buttons: &'static [&'static str],
    pub search_inputs: &'static [&'static str],
    /// Containers searched for the result entry matching the typed name.
    pub result_containers: &'static [&'static str],
}

static QUOTEX: BrokerProfile = BrokerProfile {
    variant: BrokerVariant::Quotex,
    match_tokens: &["quotex", "qxbroker"],
    asset_name_selectors: &[
        ".section-deal__name",
        ".asset-select-button__symbol",
        "div.current-asset-name",
        "[data-testid=\"asset-select-button-symbol\"]",
        "div[class*=\"asset-select-button\"] > div:first-child",
        "button[class*=\"asset-select\"] > span",
        ".pair-name-holder .pair-name",
    ],
    asset_name_first_word: false,
    payout_selectors: &[".deal-form-profit .deal-form-profit__value"],
    picker_buttons: &["button[class*=\"asset-select\"]", ".section-deal__name", ".left-sidebar-header__asset"],
    search_inputs: &["input[class*=\"search-input\"]", "input[placeholder*=\"Buscar\"]", "input[type=\"text\"]"],
    result_containers: &["div[class*=\"asset\"]", "button", "li"],
};

static POCKET_OPTION: BrokerProfile = BrokerProfile {
    variant: BrokerVariant::PocketOption,
    match_tokens: &["pocketoption", "pocket option", "po.trade"],
    asset_name_selectors: &[".current-asset-name-full"],
    asset_name_first_word: true,
    payout_selectors: &[".profit-percent .val", ".percent-val"],
    picker_buttons: &[".left-sidebar-header__asset", ".current-symbol", "button[class*=\"asset-select\"]"],
    search_inputs: &["input[class*=\"search\"]", "input[type=\"text\"]"],
    result_containers: &[".alist__item", "div[class*=\"asset\"]", "li"],
};

impl BrokerProfile {
    pub fn for_variant(variant: BrokerVariant) -> &'static BrokerProfile {
        match variant {
            BrokerVariant::Quotex => &QUOTEX,
            BrokerVariant::PocketOption => &POCKET_OPTION,
        }
    }

    pub fn matches_tab(&self, url: &str, title: &str) -> bool {
        let (url, title) = (url.to_lowercase(), title.to_lowercase());
        self.match_tokens.iter().any(|t| url.contains(t) || title.contains(t))
    }
}

/// True for a tab belonging to any supported broker.
pub fn is_broker_tab(url: &str, title: &str) -> bool {
    [&QUOTEX, &POCKET_OPTION].iter().any(|p| p.matches_tab(url, title))
}
