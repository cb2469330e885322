/// Environment variable patterns never forwarded to spawned service processes.
///
/// Patterns support a leading and/or trailing `*` wildcard and are matched
/// case-insensitively against variable names.
pub const ENV_SECRET_DENYLIST: &[&str] = &[
    "*_API_KEY",
    "*_KEY",
    "*_SECRET*",
    "*_TOKEN",
    "*_PASSWORD",
    "*_CREDENTIAL*",
    "AWS_*",
    "GITHUB_TOKEN",
    "NPM_TOKEN",
];
