/// Parsed breakdown of a client identifier string such as
/// `Geth/v1.13.14-stable-2bd6bd01/linux-amd64/go1.21.7`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientInfo {
    pub raw: String,
    pub name: String,
    pub raw_version: String,
    pub clean_version: String,
    pub os: String,
    pub arch: String,
    pub language: String,
}

const UNKNOWN: &str = "unknown";

const CLIENT_NAMES: &[(&str, &[&str])] = &[
    ("geth", &["geth", "go-ethereum"]),
    ("reth", &["reth"]),
    ("erigon", &["erigon"]),
    ("nethermind", &["nethermind"]),
    ("besu", &["besu"]),
    ("open-ethereum", &["openethereum"]),
    ("parity", &["parity"]),
    ("ethereum-js", &["ethereumjs", "ethereum-js"]),
    ("nimbus-eth1", &["nimbus", "nim"]),
];

const OSES: &[(&str, &[&str])] = &[
    ("linux", &["linux", "ubuntu"]),
    ("windows", &["windows", "win"]),
    ("mac", &["macos", "osx", "darwin"]),
    ("free-bsd", &["freebsd", "bsd"]),
];

const ARCHS: &[(&str, &[&str])] = &[
    ("amd64", &["amd64", "x86_64", "x64"]),
    ("arm", &["aarch64", "arm64", "arm"]),
    ("x86", &["x86", "386"]),
];

const LANGUAGES: &[(&str, &[&str])] = &[
    ("go", &["go1", "/go"]),
    ("rust", &["rust", "reth"]),
    ("java", &["java", "besu"]),
    ("js", &["nodejs", "javascript"]),
    ("dotnet", &["dotnet", "nethermind"]),
    ("nim", &["nimvm", "nimbus"]),
];

pub fn parse_user_agent(raw: &str) -> ClientInfo {
    let lowered = raw.to_lowercase();
    let name = classify(&lowered, CLIENT_NAMES)
        .map(str::to_string)
        .unwrap_or_else(|| fallback_name(&lowered));
    let raw_version = raw_version(raw, &name);
    let clean_version = split_or_unknown(&raw_version, '-', 0);
    ClientInfo {
        raw: raw.to_string(),
        name,
        clean_version,
        raw_version,
        os: classify(&lowered, OSES).unwrap_or(UNKNOWN).to_string(),
        arch: classify(&lowered, ARCHS).unwrap_or(UNKNOWN).to_string(),
        language: classify(&lowered, LANGUAGES).unwrap_or(UNKNOWN).to_string(),
    }
}

fn classify(lowered: &str, table: &[(&'static str, &[&str])]) -> Option<&'static str> {
    table
        .iter()
        .find(|(_, needles)| needles.iter().any(|needle| lowered.contains(needle)))
        .map(|(label, _)| *label)
}

/// When nothing in the table matches, fall back to the first `/`-segment.
fn fallback_name(lowered: &str) -> String {
    let base = lowered.split('/').next().unwrap_or_default().trim();
    if base.is_empty() {
        UNKNOWN.to_string()
    } else {
        base.to_string()
    }
}

fn raw_version(raw: &str, name: &str) -> String {
    match name {
        // nimbus style: "nimbus-eth1 v0.1.0 [linux: amd64, rocksdb, nimvm]"
        "nimbus-eth1" => split_or_unknown(raw, ' ', 1),
        // common style: "client/clean_version-dirty/os-arch/language"
        _ => split_or_unknown(raw, '/', 1),
    }
}

fn split_or_unknown(raw: &str, separator: char, index: usize) -> String {
    raw.split(separator)
        .nth(index)
        .map(str::to_string)
        .unwrap_or_else(|| UNKNOWN.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_geth_user_agent() {
        let ua = "Geth/v1.13.14-stable-2bd6bd01/linux-amd64/go1.21.7";
        let info = parse_user_agent(ua);
        assert_eq!(info.raw, ua);
        assert_eq!(info.name, "geth");
        assert_eq!(info.raw_version, "v1.13.14-stable-2bd6bd01");
        assert_eq!(info.clean_version, "v1.13.14");
        assert_eq!(info.os, "linux");
        assert_eq!(info.arch, "amd64");
        assert_eq!(info.language, "go");
    }

    #[test]
    fn parses_nethermind_user_agent() {
        let info = parse_user_agent("Nethermind/v1.25.4+20b10b35/linux-x64/dotnet8.0.2");
        assert_eq!(info.name, "nethermind");
        assert_eq!(info.language, "dotnet");
    }

    #[test]
    fn parses_nimbus_user_agent() {
        let info = parse_user_agent("nimbus-eth1 v0.1.0 [linux: amd64, rocksdb, nimvm, 6d1328]");
        assert_eq!(info.name, "nimbus-eth1");
        assert_eq!(info.raw_version, "v0.1.0");
    }

    #[test]
    fn raw_is_preserved_verbatim() {
        for ua in ["", "weird", "a/b/c", "Geth/v1.0.0"] {
            assert_eq!(parse_user_agent(ua).raw, ua);
        }
    }

    #[test]
    fn unmatched_client_falls_back_to_first_segment() {
        let info = parse_user_agent("CoolNode/v0.0.1/linux-amd64/zig");
        assert_eq!(info.name, "coolnode");
        assert_eq!(info.os, "linux");
    }

    #[test]
    fn empty_string_is_unknown() {
        let info = parse_user_agent("");
        assert_eq!(info.name, UNKNOWN);
        assert_eq!(info.os, UNKNOWN);
    }
}
