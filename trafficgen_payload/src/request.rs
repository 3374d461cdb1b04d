//! Request vocabulary: methods, URLs, referrers, user agents and names.

use std::fmt;

use rand::{
    Rng,
    distr::{Distribution, StandardUniform},
    seq::IndexedRandom,
};
use serde::{Deserialize, Serialize};

use crate::Generator;

const WORDS: [&str; 48] = [
    "about", "account", "alpha", "archive", "article", "blog", "bravo", "catalog", "category",
    "comment", "contact", "content", "deal", "delta", "detail", "echo", "event", "explore",
    "feed", "gallery", "guide", "help", "home", "index", "item", "list", "main", "media", "news",
    "offer", "page", "photo", "post", "press", "privacy", "report", "review", "search", "shop",
    "sale", "settings", "support", "tag", "terms", "topic", "video", "wishlist", "world",
];

const TLDS: [&str; 6] = ["com", "net", "org", "io", "info", "biz"];

const PAGE_SUFFIXES: [&str; 5] = [".html", ".htm", ".php", ".jsp", "/"];

const FIRST_NAMES: [&str; 24] = [
    "james", "mary", "john", "patricia", "robert", "jennifer", "michael", "linda", "william",
    "elizabeth", "david", "barbara", "richard", "susan", "joseph", "jessica", "thomas", "sarah",
    "charles", "karen", "daniel", "nancy", "matthew", "lisa",
];

const LAST_NAMES: [&str; 20] = [
    "smith", "johnson", "williams", "brown", "jones", "garcia", "miller", "davis", "rodriguez",
    "martinez", "hernandez", "lopez", "gonzalez", "wilson", "anderson", "thomas", "taylor",
    "moore", "jackson", "martin",
];

const USER_AGENTS: [&str; 10] = [
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/17.1 Safari/605.1.15",
    "Mozilla/5.0 (X11; Linux x86_64; rv:121.0) Gecko/20100101 Firefox/121.0",
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64; rv:120.0) Gecko/20100101 Firefox/120.0",
    "Mozilla/5.0 (iPhone; CPU iPhone OS 17_1 like Mac OS X) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/17.1 Mobile/15E148 Safari/604.1",
    "Mozilla/5.0 (Linux; Android 14; Pixel 8) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/119.0.0.0 Mobile Safari/537.36",
    "Mozilla/5.0 (iPad; CPU OS 16_6 like Mac OS X) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/16.6 Mobile/15E148 Safari/604.1",
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/119.0.0.0 Safari/537.36 Edg/119.0.2151.97",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36",
    "Opera/9.80 (X11; Linux i686; U; en) Presto/2.12.388 Version/12.16",
];

/// HTTP request methods emitted by the generator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Method {
    /// GET
    #[serde(alias = "get")]
    Get,
    /// POST
    #[serde(alias = "post")]
    Post,
    /// PUT
    #[serde(alias = "put")]
    Put,
    /// DELETE
    #[serde(alias = "delete")]
    Delete,
    /// PATCH
    #[serde(alias = "patch")]
    Patch,
}

impl Method {
    /// The method's name as it appears on the wire.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Method::Get => "GET",
            Method::Post => "POST",
            Method::Put => "PUT",
            Method::Delete => "DELETE",
            Method::Patch => "PATCH",
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Distribution<Method> for StandardUniform {
    fn sample<R>(&self, rng: &mut R) -> Method
    where
        R: Rng + ?Sized,
    {
        match rng.random_range(0..5) {
            0 => Method::Get,
            1 => Method::Post,
            2 => Method::Put,
            3 => Method::Delete,
            4 => Method::Patch,
            _ => unreachable!(),
        }
    }
}

/// Chooses the method for a flow URL by substring pattern.
///
/// The longest matching pattern wins, equal lengths go to the
/// lexicographically smaller pattern. URLs nothing matches are `GET`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MethodMap {
    patterns: Vec<(String, Method)>,
}

impl MethodMap {
    /// Create a new [`MethodMap`]. Empty patterns are ignored.
    pub fn new<I>(patterns: I) -> Self
    where
        I: IntoIterator<Item = (String, Method)>,
    {
        let mut patterns: Vec<(String, Method)> = patterns
            .into_iter()
            .filter(|(pattern, _)| !pattern.is_empty())
            .collect();
        patterns.sort_by(|(a, _), (b, _)| b.len().cmp(&a.len()).then_with(|| a.cmp(b)));
        Self { patterns }
    }

    /// The method to use for `url`.
    #[must_use]
    pub fn method_for(&self, url: &str) -> Method {
        self.patterns
            .iter()
            .find(|(pattern, _)| url.contains(pattern.as_str()))
            .map_or(Method::Get, |(_, method)| *method)
    }

    /// Number of configured patterns.
    #[must_use]
    pub fn len(&self) -> usize {
        self.patterns.len()
    }

    /// Whether no pattern is configured.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }
}

fn word<R>(rng: &mut R) -> &'static str
where
    R: Rng + ?Sized,
{
    WORDS.choose(rng).copied().unwrap_or("index")
}

/// A browser user agent string.
pub fn user_agent<R>(rng: &mut R) -> &'static str
where
    R: Rng + ?Sized,
{
    USER_AGENTS.choose(rng).copied().unwrap_or(USER_AGENTS[0])
}

/// A plausible user name, used whenever the identity service is unavailable.
pub fn fallback_user_name<R>(rng: &mut R) -> String
where
    R: Rng + ?Sized,
{
    let first = FIRST_NAMES.choose(rng).copied().unwrap_or("user");
    let last = LAST_NAMES.choose(rng).copied().unwrap_or("name");
    match rng.random_range(0..4) {
        0 => format!("{first}{last}"),
        1 => format!("{first}.{last}"),
        2 => format!("{}{last}", &first[..1]),
        _ => format!("{first}{}", rng.random_range(1..100)),
    }
}

/// URLs of requests that belong to no flow.
///
/// A path of one to three words, replaced with probability 0.3 by a product
/// page, else with probability 0.2 by the requesting user's profile when the
/// user has an id, else with probability 0.2 by the profile of a named user.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AnonymousUrl {
    /// Identifier of the requesting user, if any.
    pub user_id: Option<u64>,
}

impl Generator<String> for AnonymousUrl {
    fn generate<R>(&self, rng: &mut R) -> String
    where
        R: Rng + ?Sized,
    {
        if rng.random_bool(0.3) {
            return format!("/products/{}/{}", word(rng), rng.random_range(1_000..=9_999));
        }
        let own_profile = rng.random_bool(0.2);
        if let (true, Some(id)) = (own_profile, self.user_id) {
            return format!("/users/{id}/profile");
        }
        if rng.random_bool(0.2) {
            return format!("/users/{}/profile", fallback_user_name(rng));
        }
        let depth = rng.random_range(1..=3);
        let mut path = String::new();
        for _ in 0..depth {
            path.push('/');
            path.push_str(word(rng));
        }
        path
    }
}

/// Synthetic `Referer` header values.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Referrer;

impl Generator<String> for Referrer {
    fn generate<R>(&self, rng: &mut R) -> String
    where
        R: Rng + ?Sized,
    {
        let scheme = if rng.random_bool(0.5) { "https" } else { "http" };
        let host = word(rng);
        let tld = TLDS.choose(rng).copied().unwrap_or("com");
        let mut url = format!("{scheme}://www.{host}.{tld}/");
        let depth = rng.random_range(0..=2);
        for idx in 0..depth {
            if idx > 0 {
                url.push('/');
            }
            url.push_str(word(rng));
        }
        if depth > 0 {
            url.push_str(PAGE_SUFFIXES.choose(rng).copied().unwrap_or("/"));
        }
        url
    }
}

#[cfg(test)]
mod test {
    use proptest::prelude::*;
    use rand::{SeedableRng, rngs::SmallRng};

    use super::*;

    #[test]
    fn method_map_prefers_longest_pattern() {
        let map = MethodMap::new([
            ("/cart".to_string(), Method::Get),
            ("/add_to_cart".to_string(), Method::Post),
            ("/checkout".to_string(), Method::Post),
            ("/profile".to_string(), Method::Put),
            (String::new(), Method::Delete),
        ]);
        assert_eq!(map.len(), 4);
        assert_eq!(map.method_for("/add_to_cart/17"), Method::Post);
        assert_eq!(map.method_for("/cart"), Method::Get);
        assert_eq!(map.method_for("/users/9/profile"), Method::Put);
        assert_eq!(map.method_for("/about"), Method::Get);
    }

    #[test]
    fn method_names_round_trip_through_display() {
        for method in [
            Method::Get,
            Method::Post,
            Method::Put,
            Method::Delete,
            Method::Patch,
        ] {
            let json = format!("\"{method}\"");
            let parsed: Method = serde_json::from_str(&json).expect("uppercase parses");
            assert_eq!(parsed, method);
        }
        let lower: Method = serde_json::from_str("\"patch\"").expect("lowercase parses");
        assert_eq!(lower, Method::Patch);
    }

    #[test]
    fn anonymous_urls_without_user_never_name_an_id() {
        let mut rng = SmallRng::seed_from_u64(5);
        let generator = AnonymousUrl { user_id: None };
        let mut saw_product = false;
        for _ in 0..2_000 {
            let url = generator.generate(&mut rng);
            assert!(url.starts_with('/'), "{url}");
            saw_product |= url.starts_with("/products/");
            if let Some(rest) = url.strip_prefix("/users/") {
                let name = rest.trim_end_matches("/profile");
                assert!(name.parse::<u64>().is_err(), "{url}");
            }
        }
        assert!(saw_product);
    }

    #[test]
    fn anonymous_urls_with_user_visit_own_profile() {
        let mut rng = SmallRng::seed_from_u64(5);
        let generator = AnonymousUrl { user_id: Some(77) };
        let visits = (0..2_000)
            .filter(|_| generator.generate(&mut rng) == "/users/77/profile")
            .count();
        assert!(visits > 0);
    }

    proptest! {
        #[test]
        fn referrers_are_absolute_urls(seed: u64) {
            let mut rng = SmallRng::seed_from_u64(seed);
            let referrer = Referrer.generate(&mut rng);
            prop_assert!(
                referrer.starts_with("http://www.") || referrer.starts_with("https://www."),
                "{}", referrer
            );
        }

        #[test]
        fn fallback_names_are_non_empty(seed: u64) {
            let mut rng = SmallRng::seed_from_u64(seed);
            let name = fallback_user_name(&mut rng);
            prop_assert!(!name.is_empty());
            prop_assert!(!name.contains(' '));
        }
    }
}
