//! Write operations flowing through the batching pipeline.

use chrono::{DateTime, Utc};
use sqlx::PgConnection;

/// One enqueued write. Ops carry plain row data so the writer tasks stay
/// independent of the domain types.
#[derive(Debug, Clone)]
pub enum StoreOp {
    UpsertEnr(EnrRow),
    EnsureNodeInfo(HostRow),
    InsertAttempt(AttemptRow),
    UpsertNodeInfo(NodeInfoRow),
    UpdateChainDetails(ChainRow),
    UpsertIpInfo(IpInfoRow),
    InsertActivePeers(ActivePeersRow),
}

#[derive(Debug, Clone)]
pub struct EnrRow {
    pub node_id: String,
    pub seen_at: DateTime<Utc>,
    pub ip: String,
    pub tcp: i32,
    pub udp: i32,
    pub seq: i64,
    pub pubkey: String,
    pub record: Option<String>,
}

#[derive(Debug, Clone)]
pub struct HostRow {
    pub node_id: String,
    pub pubkey: String,
    pub ip: String,
    pub tcp: i32,
}

#[derive(Debug, Clone)]
pub struct AttemptRow {
    pub node_id: String,
    pub timestamp: DateTime<Utc>,
    pub status: String,
    pub error: String,
    pub latency_ms: Option<i64>,
    pub deprecable: bool,
}

#[derive(Debug, Clone)]
pub struct NodeInfoRow {
    pub node_id: String,
    pub pubkey: String,
    pub ip: String,
    pub tcp: i32,
    pub connected_at: DateTime<Utc>,
    pub raw_user_agent: String,
    pub client_name: String,
    pub client_raw_version: String,
    pub client_clean_version: String,
    pub client_os: String,
    pub client_arch: String,
    pub client_language: String,
    pub capabilities: Vec<String>,
    pub software_info: i64,
    pub deprecated: bool,
}

#[derive(Debug, Clone)]
pub struct ChainRow {
    pub node_id: String,
    pub fork_id: String,
    pub protocol_version: i64,
    pub head_hash: String,
    pub network_id: i64,
    pub total_difficulty: String,
}

#[derive(Debug, Clone)]
pub struct IpInfoRow {
    pub ip: String,
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
    pub asn: String,
    pub asn_name: String,
    pub mobile: bool,
    pub proxy: bool,
    pub hosting: bool,
    pub expiration_time: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct ActivePeersRow {
    pub timestamp: DateTime<Utc>,
    pub peers: Vec<i64>,
}

impl StoreOp {
    pub(crate) async fn execute(&self, conn: &mut PgConnection) -> Result<(), sqlx::Error> {
        match self {
            StoreOp::UpsertEnr(row) => {
                sqlx::query(
                    r#"
                    INSERT INTO enrs (node_id, first_seen, last_seen, ip, tcp, udp, seq, pubkey, record)
                    VALUES ($1, $2, $2, $3, $4, $5, $6, $7, $8)
                    ON CONFLICT (node_id) DO UPDATE SET
                        last_seen = $2,
                        ip = $3,
                        tcp = $4,
                        udp = $5,
                        seq = $6,
                        pubkey = $7,
                        record = COALESCE($8, enrs.record)
                    "#,
                )
                .bind(&row.node_id)
                .bind(row.seen_at)
                .bind(&row.ip)
                .bind(row.tcp)
                .bind(row.udp)
                .bind(row.seq)
                .bind(&row.pubkey)
                .bind(&row.record)
                .execute(&mut *conn)
                .await?;
            }
            StoreOp::EnsureNodeInfo(row) => {
                sqlx::query(
                    r#"
                    INSERT INTO node_info (node_id, pubkey, ip, tcp, deprecated)
                    VALUES ($1, $2, $3, $4, FALSE)
                    ON CONFLICT (node_id) DO UPDATE SET
                        ip = $3,
                        tcp = $4,
                        deprecated = FALSE
                    "#,
                )
                .bind(&row.node_id)
                .bind(&row.pubkey)
                .bind(&row.ip)
                .bind(row.tcp)
                .execute(&mut *conn)
                .await?;
            }
            StoreOp::InsertAttempt(row) => {
                sqlx::query(
                    r#"
                    INSERT INTO connection_attempts (node_id, timestamp, status, error, latency, deprecable)
                    VALUES ($1, $2, $3, $4, $5, $6)
                    "#,
                )
                .bind(&row.node_id)
                .bind(row.timestamp)
                .bind(&row.status)
                .bind(&row.error)
                .bind(row.latency_ms)
                .bind(row.deprecable)
                .execute(&mut *conn)
                .await?;

                sqlx::query(
                    r#"
                    UPDATE node_info SET
                        last_tried = $2,
                        error = $3,
                        latency = $4,
                        deprecated = node_info.deprecated OR $5
                    WHERE node_id = $1
                    "#,
                )
                .bind(&row.node_id)
                .bind(row.timestamp)
                .bind(&row.error)
                .bind(row.latency_ms)
                .bind(row.deprecable)
                .execute(&mut *conn)
                .await?;
            }
            StoreOp::UpsertNodeInfo(row) => {
                sqlx::query(
                    r#"
                    INSERT INTO node_info (
                        node_id, pubkey, ip, tcp,
                        first_connected, last_connected,
                        raw_user_agent, client_name, client_raw_version,
                        client_clean_version, client_os, client_arch, client_language,
                        capabilities, software_info, deprecated
                    ) VALUES ($1, $2, $3, $4, $5, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)
                    ON CONFLICT (node_id) DO UPDATE SET
                        ip = $3,
                        tcp = $4,
                        first_connected = COALESCE(node_info.first_connected, $5),
                        last_connected = $5,
                        raw_user_agent = $6,
                        client_name = $7,
                        client_raw_version = $8,
                        client_clean_version = $9,
                        client_os = $10,
                        client_arch = $11,
                        client_language = $12,
                        capabilities = $13,
                        software_info = $14,
                        deprecated = $15
                    "#,
                )
                .bind(&row.node_id)
                .bind(&row.pubkey)
                .bind(&row.ip)
                .bind(row.tcp)
                .bind(row.connected_at)
                .bind(&row.raw_user_agent)
                .bind(&row.client_name)
                .bind(&row.client_raw_version)
                .bind(&row.client_clean_version)
                .bind(&row.client_os)
                .bind(&row.client_arch)
                .bind(&row.client_language)
                .bind(&row.capabilities)
                .bind(row.software_info)
                .bind(row.deprecated)
                .execute(&mut *conn)
                .await?;
            }
            StoreOp::UpdateChainDetails(row) => {
                sqlx::query(
                    r#"
                    UPDATE node_info SET
                        fork_id = $2,
                        protocol_version = $3,
                        head_hash = $4,
                        network_id = $5,
                        total_difficulty = $6
                    WHERE node_id = $1
                    "#,
                )
                .bind(&row.node_id)
                .bind(&row.fork_id)
                .bind(row.protocol_version)
                .bind(&row.head_hash)
                .bind(row.network_id)
                .bind(&row.total_difficulty)
                .execute(&mut *conn)
                .await?;
            }
            StoreOp::UpsertIpInfo(row) => {
                sqlx::query(
                    r#"
                    INSERT INTO ip_info (
                        ip, continent, continent_code, country, country_code,
                        region, region_name, city, zip, lat, lon,
                        isp, org, asn, asn_name, mobile, proxy, hosting,
                        expiration_time
                    ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11,
                              $12, $13, $14, $15, $16, $17, $18, $19)
                    ON CONFLICT (ip) DO UPDATE SET
                        continent = $2,
                        continent_code = $3,
                        country = $4,
                        country_code = $5,
                        region = $6,
                        region_name = $7,
                        city = $8,
                        zip = $9,
                        lat = $10,
                        lon = $11,
                        isp = $12,
                        org = $13,
                        asn = $14,
                        asn_name = $15,
                        mobile = $16,
                        proxy = $17,
                        hosting = $18,
                        expiration_time = $19
                    "#,
                )
                .bind(&row.ip)
                .bind(&row.continent)
                .bind(&row.continent_code)
                .bind(&row.country)
                .bind(&row.country_code)
                .bind(&row.region)
                .bind(&row.region_name)
                .bind(&row.city)
                .bind(&row.zip)
                .bind(row.lat)
                .bind(row.lon)
                .bind(&row.isp)
                .bind(&row.org)
                .bind(&row.asn)
                .bind(&row.asn_name)
                .bind(row.mobile)
                .bind(row.proxy)
                .bind(row.hosting)
                .bind(row.expiration_time)
                .execute(&mut *conn)
                .await?;
            }
            StoreOp::InsertActivePeers(row) => {
                sqlx::query(
                    r#"
                    INSERT INTO active_peers (timestamp, peers) VALUES ($1, $2)
                    "#,
                )
                .bind(row.timestamp)
                .bind(&row.peers)
                .execute(&mut *conn)
                .await?;
            }
        }
        Ok(())
    }
}
