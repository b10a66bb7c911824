//! Known crawler user-agent tokens.

use crate::domain::types::BotCategory;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CrawlerSignature {
    /// Lowercase substring searched in the user agent.
    pub token: &'static str,
    pub category: BotCategory,
}

const fn signature(token: &'static str, category: BotCategory) -> CrawlerSignature {
    CrawlerSignature { token, category }
}

/// Catalog searched in order; specific tokens precede generic ones.
pub const KNOWN_CRAWLERS: &[CrawlerSignature] = &[
    // Search engines
    signature("googlebot", BotCategory::SearchEngine),
    signature("google-inspectiontool", BotCategory::SearchEngine),
    signature("storebot-google", BotCategory::SearchEngine),
    signature("adsbot-google", BotCategory::SearchEngine),
    signature("bingbot", BotCategory::SearchEngine),
    signature("bingpreview", BotCategory::SearchEngine),
    signature("yandex", BotCategory::SearchEngine),
    signature("baiduspider", BotCategory::SearchEngine),
    signature("duckduckbot", BotCategory::SearchEngine),
    signature("slurp", BotCategory::SearchEngine),
    signature("applebot", BotCategory::SearchEngine),
    signature("petalbot", BotCategory::SearchEngine),
    signature("sogou", BotCategory::SearchEngine),
    signature("seznambot", BotCategory::SearchEngine),
    signature("naver", BotCategory::SearchEngine),
    signature("qwantify", BotCategory::SearchEngine),
    // Link previews and social
    signature("facebookexternalhit", BotCategory::Social),
    signature("facebookcatalog", BotCategory::Social),
    signature("twitterbot", BotCategory::Social),
    signature("linkedinbot", BotCategory::Social),
    signature("pinterest", BotCategory::Social),
    signature("slackbot", BotCategory::Social),
    signature("slack-imgproxy", BotCategory::Social),
    signature("discordbot", BotCategory::Social),
    signature("telegrambot", BotCategory::Social),
    signature("whatsapp", BotCategory::Social),
    signature("redditbot", BotCategory::Social),
    signature("vkshare", BotCategory::Social),
    signature("skypeuripreview", BotCategory::Social),
    signature("embedly", BotCategory::Social),
    signature("quora link preview", BotCategory::Social),
    signature("tumblr", BotCategory::Social),
    signature("flipboard", BotCategory::Social),
    signature("bitlybot", BotCategory::Social),
    signature("nuzzel", BotCategory::Social),
    signature("outbrain", BotCategory::Social),
    signature("xing-contenttabreceiver", BotCategory::Social),
    signature("bitrix link preview", BotCategory::Social),
    // Monitoring and auditing
    signature("uptimerobot", BotCategory::Monitoring),
    signature("pingdom", BotCategory::Monitoring),
    signature("statuscake", BotCategory::Monitoring),
    signature("site24x7", BotCategory::Monitoring),
    signature("newrelicpinger", BotCategory::Monitoring),
    signature("datadogsynthetics", BotCategory::Monitoring),
    signature("chrome-lighthouse", BotCategory::Monitoring),
    signature("google page speed", BotCategory::Monitoring),
    signature("w3c_validator", BotCategory::Monitoring),
    // SEO tools and generic crawlers
    signature("ahrefsbot", BotCategory::Other),
    signature("semrushbot", BotCategory::Other),
    signature("mj12bot", BotCategory::Other),
    signature("dotbot", BotCategory::Other),
    signature("rogerbot", BotCategory::Other),
    signature("screaming frog", BotCategory::Other),
    signature("showyoubot", BotCategory::Other),
    signature("gptbot", BotCategory::Other),
    signature("ccbot", BotCategory::Other),
    signature("crawler", BotCategory::Other),
    signature("spider", BotCategory::Other),
];

/// First catalog signature contained in `user_agent`, ignoring case.
pub fn match_user_agent(user_agent: &str) -> Option<&'static CrawlerSignature> {
    let lowered = user_agent.to_ascii_lowercase();
    KNOWN_CRAWLERS
        .iter()
        .find(|signature| lowered.contains(signature.token))
}
