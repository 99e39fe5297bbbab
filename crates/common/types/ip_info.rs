use chrono::{DateTime, Duration, Utc};
use serde::Deserialize;
use std::net::IpAddr;

/// Geolocation records are refreshed after this long.
pub const IP_INFO_TTL: Duration = Duration::days(30);

/// Response payload of the ip-api.com `json` endpoint.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct IpApiMsg {
    #[serde(rename = "query")]
    pub ip: String,
    pub status: String,
    pub continent: String,
    pub continent_code: String,
    pub country: String,
    pub country_code: String,
    pub region: String,
    pub region_name: String,
    pub city: String,
    pub zip: String,
    pub lat: f64,
    pub lon: f64,
    pub isp: String,
    pub org: String,
    #[serde(rename = "as")]
    pub asn: String,
    #[serde(rename = "asname")]
    pub asn_name: String,
    pub mobile: bool,
    pub proxy: bool,
    pub hosting: bool,
}

impl IpApiMsg {
    pub fn is_empty(&self) -> bool {
        self.country.is_empty() && self.city.is_empty()
    }
}

/// Persisted geolocation and ASN attributes for a single IP address.
#[derive(Debug, Clone)]
pub struct IpInfo {
    pub msg: IpApiMsg,
    pub expiration_time: DateTime<Utc>,
}

impl IpInfo {
    pub fn from_msg(msg: IpApiMsg) -> Self {
        Self {
            msg,
            expiration_time: Utc::now() + IP_INFO_TTL,
        }
    }
}

/// Addresses worth geolocating: everything outside the RFC 1918 ranges,
/// loopback and the unspecified address.
pub fn is_ip_public(ip: &IpAddr) -> bool {
    if ip.is_loopback() || ip.is_unspecified() {
        return false;
    }
    match ip {
        IpAddr::V4(ip) => !ip.is_private(),
        IpAddr::V6(_) => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{Ipv4Addr, Ipv6Addr};

    #[test]
    fn private_ranges_are_not_public() {
        for ip in [
            "10.0.0.1",
            "10.255.255.254",
            "172.16.0.1",
            "172.31.200.4",
            "192.168.1.1",
            "127.0.0.1",
            "0.0.0.0",
        ] {
            let ip: IpAddr = ip.parse().unwrap();
            assert!(!is_ip_public(&ip), "{ip} should not be public");
        }
    }

    #[test]
    fn global_addresses_are_public() {
        for ip in ["18.138.108.67", "1.1.1.1", "172.32.0.1", "8.8.8.8"] {
            let ip: IpAddr = ip.parse().unwrap();
            assert!(is_ip_public(&ip), "{ip} should be public");
        }
    }

    #[test]
    fn v6_loopback_and_unspecified_are_not_public() {
        assert!(!is_ip_public(&IpAddr::V6(Ipv6Addr::LOCALHOST)));
        assert!(!is_ip_public(&IpAddr::V6(Ipv6Addr::UNSPECIFIED)));
        assert!(!is_ip_public(&IpAddr::V4(Ipv4Addr::UNSPECIFIED)));
    }

    #[test]
    fn ip_api_json_decodes() {
        let raw = r#"{
            "status":"success","continent":"Europe","continentCode":"EU",
            "country":"Spain","countryCode":"ES","region":"CT",
            "regionName":"Catalonia","city":"Barcelona","zip":"08001",
            "lat":41.38,"lon":2.17,"isp":"Some ISP","org":"Org",
            "as":"AS12345 Some ISP","asname":"SOMEISP",
            "mobile":false,"proxy":false,"hosting":true,"query":"1.2.3.4"
        }"#;
        let msg: IpApiMsg = serde_json::from_str(raw).unwrap();
        assert_eq!(msg.ip, "1.2.3.4");
        assert_eq!(msg.country_code, "ES");
        assert!(msg.hosting);
        assert!(!msg.is_empty());
    }
}
