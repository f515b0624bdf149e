//! Build version and user-agent helpers

/// Git short hash of the build, `dev` outside a checkout
pub const GIT_HASH: &str = env!("OUTPOST_GIT_HASH");

/// Unix time of the build's commit
pub const VERSION_TIME_STR: &str = env!("OUTPOST_VERSION_TIME");

/// Build time as unix seconds, 0 when unknown
pub fn version_time() -> i64 {
    VERSION_TIME_STR.parse().unwrap_or(0)
}

/// `{os}; {arch}` of this build
pub fn platform() -> String {
    format!("{}; {}", std::env::consts::OS, std::env::consts::ARCH)
}

/// `outpost/{rev}@{unix_time} ({os}; {arch})`
pub fn user_agent() -> String {
    format!("outpost/{}@{} ({})", GIT_HASH, version_time(), platform())
}

/// Parsed form of a peer's user agent
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserAgentInfo {
    pub revision: String,
    pub version_time: i64,
    pub platform: String,
}

/// Parse `product/{rev}@{time} ({platform})`
pub fn parse_user_agent(user_agent: &str) -> Option<UserAgentInfo> {
    let (product, rest) = user_agent.split_once(' ')?;
    let platform = rest.trim().strip_prefix('(')?.strip_suffix(')')?;
    let (_, version) = product.split_once('/')?;
    let (revision, time) = version.rsplit_once('@')?;

    Some(UserAgentInfo {
        revision: revision.to_string(),
        version_time: time.parse().ok()?,
        platform: platform.to_string(),
    })
}

/// Whether a peer with `user_agent` can be upgraded to this build
pub fn is_upgradable(user_agent: &str) -> bool {
    is_upgradable_to(user_agent, &platform(), version_time())
}

/// Whether a peer with `user_agent` can be upgraded to a build for
/// `platform` made at `version_time`
pub fn is_upgradable_to(user_agent: &str, platform: &str, version_time: i64) -> bool {
    match parse_user_agent(user_agent) {
        Some(info) => {
            info.platform == platform && info.version_time != 0 && info.version_time < version_time
        }
        None => false,
    }
}
