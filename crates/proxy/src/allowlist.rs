//! Static backend allow-list and hostname validation

use crate::route::RouteClass;
use once_cell::sync::Lazy;
use regex::Regex;

/// Hostnames permitted to serve as upstream backends, in canonical order.
pub const BACKENDS: &[&str] = &[
    "shellshock.io",
    "algebra.best",
    "algebra.vip",
    "algebra.monster",
    "biologyclass.club",
    "combateggs.com",
    "deadlyegg.com",
    "deathegg.life",
    "deathegg.world",
    "egg.dance",
    "eggbattle.com",
    "eggboy.club",
    "eggcombat.com",
    "eggfacts.fun",
    "egggames.best",
    "egghead.institute",
    "eggisthenewblack.com",
    "eggsarecool.com",
    "eggshock.com",
    "eggshock.me",
    "eggshock.net",
    "eggshooter.best",
    "eggshooter.com",
    "eggtown.org",
    "eggwarfare.com",
    "eggwars.io",
    "geometry.best",
    "geometry.monster",
    "geometry.pw",
    "geometry.report",
    "hardboiled.life",
    "hardshell.life",
    "historicreview.com",
    "humanorganising.org",
    "mathactivity.club",
    "mathactivity.xyz",
    "mathdrills.info",
    "mathdrills.life",
    "mathfun.rocks",
    "mathgames.world",
    "math.international",
    "mathlete.fun",
    "mathlete.pro",
    "overeasy.club",
    "risenegg.com",
    "scrambled.us",
    "scrambled.tech",
    "scrambled.world",
    "scrambled.today",
    "scrambled.best",
    "shellgame.me",
    "shellgame.one",
    "shellgame.quest",
    "shellplay.live",
    "shellplay.org",
    "shellshock.guru",
    "shellshockers.ca",
    "shellshockers.us",
    "shellshockers.life",
    "shellshockers.best",
    "shellshockers.website",
    "shellshockers.wiki",
    "shellshockers.xyz",
    "shellshockers.club",
    "shellshockers.world",
    "shellshockers.site",
    "shellshockers.today",
    "shockers.live",
    "shockers.one",
    "softboiled.club",
    "yolk.life",
    "yolk.tech",
    "yolk.rocks",
    "yolk.best",
    "violentegg.club",
    "violentegg.fun",
    "zygote.cafe",
    "shellsocks.com",
    "urbanegger.com",
    "eggboy.me",
    "eggboy.xyz",
    "yolk.quest",
    "yolk.today",
    "yolk.monster",
];

/// Dev game servers, e.g. `egs-static-dev-uswest-z6w70a8.shellshock.io`
static GAME_DEV_HOST: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^egs-(?:static-)?dev-[a-z0-9-]+\.shellshock\.io$")
        .expect("dev host pattern is valid")
});

/// The compiled-in allow-list.
///
/// Immutable and shared by every request; selection always works on copies.
#[derive(Debug, Clone, Copy)]
pub struct AllowList {
    hosts: &'static [&'static str],
}

impl Default for AllowList {
    fn default() -> Self {
        Self { hosts: BACKENDS }
    }
}

impl AllowList {
    pub fn hosts(&self) -> &'static [&'static str] {
        self.hosts
    }

    pub fn len(&self) -> usize {
        self.hosts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hosts.is_empty()
    }

    /// True when `host` is a listed domain or a subdomain of one
    pub fn contains(&self, host: &str) -> bool {
        let host = host.to_ascii_lowercase();
        self.hosts.iter().any(|domain| {
            host == *domain
                || host
                    .strip_suffix(domain)
                    .is_some_and(|prefix| prefix.ends_with('.'))
        })
    }

    /// True when `host` matches the dev game server family
    pub fn is_game_dev_host(host: &str) -> bool {
        GAME_DEV_HOST.is_match(&host.to_ascii_lowercase())
    }

    /// Route-specific validity check applied to every candidate
    pub fn is_valid_backend(&self, host: &str, route: RouteClass) -> bool {
        if host.is_empty() {
            return false;
        }
        match route {
            RouteClass::Game => Self::is_game_dev_host(host) || self.contains(host),
            RouteClass::Matchmaker | RouteClass::Services => self.contains(host),
        }
    }
}
