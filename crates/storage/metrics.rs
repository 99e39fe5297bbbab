//! Analytic reads feeding the metrics exporter. Every query scopes to nodes
//! that were identified and recently active.

use sqlx::Row;
use tracing::debug;

use crate::{Store, StoreError};

/// Counts of peers behind mobile, proxy and hosting IPs.
#[derive(Debug, Clone, Copy, Default)]
pub struct HostingDistribution {
    pub mobile: i64,
    pub under_proxy: i64,
    pub hosted: i64,
}

impl Store {
    /// Number of active peers per client family.
    pub async fn get_client_distribution(&self) -> Result<Vec<(String, i64)>, StoreError> {
        debug!("fetching client distribution");
        let rows = sqlx::query(
            r#"
            SELECT client_name, count(client_name) as cnt
            FROM node_info
            WHERE first_connected IS NOT NULL AND
                deprecated = FALSE AND
                client_name IS NOT NULL AND
                last_connected > CURRENT_TIMESTAMP - ($1 * INTERVAL '1 DAY')
            GROUP BY client_name
            ORDER BY cnt DESC
            "#,
        )
        .bind(self.activity_window_days())
        .fetch_all(self.pool())
        .await?;
        Ok(rows
            .iter()
            .map(|row| (row.get("client_name"), row.get("cnt")))
            .collect())
    }

    /// Number of active peers per client family and version.
    pub async fn get_version_distribution(&self) -> Result<Vec<(String, i64)>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT client_name, client_raw_version, count(client_raw_version) as cnt
            FROM node_info
            WHERE first_connected IS NOT NULL AND
                deprecated = FALSE AND
                client_name IS NOT NULL AND
                last_connected > CURRENT_TIMESTAMP - ($1 * INTERVAL '1 DAY')
            GROUP BY client_name, client_raw_version
            ORDER BY client_name DESC, cnt DESC
            "#,
        )
        .bind(self.activity_window_days())
        .fetch_all(self.pool())
        .await?;
        Ok(rows
            .iter()
            .map(|row| {
                let name: String = row.get("client_name");
                let version: String = row.get("client_raw_version");
                (format!("{name}_{version}"), row.get("cnt"))
            })
            .collect())
    }

    /// Number of active peers per country code.
    pub async fn get_geo_distribution(&self) -> Result<Vec<(String, i64)>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT aux.country_code as country_code, count(aux.country_code) as cnt
            FROM (
                SELECT node_info.node_id, ip_info.country_code
                FROM node_info
                INNER JOIN ip_info ON node_info.ip = ip_info.ip
                WHERE first_connected IS NOT NULL AND
                    deprecated = FALSE AND
                    client_name IS NOT NULL AND
                    last_connected > CURRENT_TIMESTAMP - ($1 * INTERVAL '1 DAY')
            ) as aux
            GROUP BY country_code
            ORDER BY cnt DESC
            "#,
        )
        .bind(self.activity_window_days())
        .fetch_all(self.pool())
        .await?;
        Ok(rows
            .iter()
            .map(|row| (row.get("country_code"), row.get("cnt")))
            .collect())
    }

    pub async fn get_os_distribution(&self) -> Result<Vec<(String, i64)>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT client_os, count(client_os) as cnt
            FROM node_info
            WHERE first_connected IS NOT NULL AND
                deprecated = FALSE AND
                client_name IS NOT NULL AND
                last_connected > CURRENT_TIMESTAMP - ($1 * INTERVAL '1 DAY')
            GROUP BY client_os
            ORDER BY cnt DESC
            "#,
        )
        .bind(self.activity_window_days())
        .fetch_all(self.pool())
        .await?;
        Ok(rows
            .iter()
            .map(|row| (row.get("client_os"), row.get("cnt")))
            .collect())
    }

    pub async fn get_arch_distribution(&self) -> Result<Vec<(String, i64)>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT client_arch, count(client_arch) as cnt
            FROM node_info
            WHERE first_connected IS NOT NULL AND
                deprecated = FALSE AND
                client_name IS NOT NULL AND
                last_connected > CURRENT_TIMESTAMP - ($1 * INTERVAL '1 DAY')
            GROUP BY client_arch
            ORDER BY cnt DESC
            "#,
        )
        .bind(self.activity_window_days())
        .fetch_all(self.pool())
        .await?;
        Ok(rows
            .iter()
            .map(|row| (row.get("client_arch"), row.get("cnt")))
            .collect())
    }

    pub async fn get_hosting_distribution(&self) -> Result<HostingDistribution, StoreError> {
        Ok(HostingDistribution {
            mobile: self.count_peers_with_ip_flag("mobile").await?,
            under_proxy: self.count_peers_with_ip_flag("proxy").await?,
            hosted: self.count_peers_with_ip_flag("hosting").await?,
        })
    }

    async fn count_peers_with_ip_flag(&self, flag: &str) -> Result<i64, StoreError> {
        let query = format!(
            r#"
            SELECT count(*) as cnt
            FROM node_info as ni
            INNER JOIN ip_info ON ni.ip = ip_info.ip
            WHERE ni.deprecated = FALSE AND
                ni.first_connected IS NOT NULL AND
                ni.client_name IS NOT NULL AND
                ip_info.{flag} = TRUE AND
                ni.last_connected > CURRENT_TIMESTAMP - ($1 * INTERVAL '1 DAY')
            "#
        );
        let count: i64 = sqlx::query(&query)
            .bind(self.activity_window_days())
            .fetch_one(self.pool())
            .await?
            .get("cnt");
        Ok(count)
    }

    /// How many IPs host 1, 2, 3... nodes.
    pub async fn get_ip_distribution(&self) -> Result<Vec<(String, i64)>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT nodes as nodes_per_ip, count(t.nodes) as cnt
            FROM (
                SELECT ip, count(ip) as nodes
                FROM node_info
                WHERE deprecated = FALSE AND
                    client_name IS NOT NULL AND
                    last_connected > CURRENT_TIMESTAMP - ($1 * INTERVAL '1 DAY')
                GROUP BY ip
                ORDER BY nodes DESC
            ) as t
            GROUP BY nodes
            ORDER BY cnt DESC
            "#,
        )
        .bind(self.activity_window_days())
        .fetch_all(self.pool())
        .await?;
        Ok(rows
            .iter()
            .map(|row| {
                let nodes_per_ip: i64 = row.get("nodes_per_ip");
                (nodes_per_ip.to_string(), row.get("cnt"))
            })
            .collect())
    }

    /// Latency distribution in 100 ms buckets up to one second.
    pub async fn get_rtt_distribution(&self) -> Result<Vec<(String, i64)>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT t.latency as latency_range, count(*) as cnt
            FROM (
                SELECT
                    CASE
                        WHEN latency BETWEEN 0 AND 100 THEN '0-100ms'
                        WHEN latency BETWEEN 101 AND 200 THEN '101-200ms'
                        WHEN latency BETWEEN 201 AND 300 THEN '201-300ms'
                        WHEN latency BETWEEN 301 AND 400 THEN '301-400ms'
                        WHEN latency BETWEEN 401 AND 500 THEN '401-500ms'
                        WHEN latency BETWEEN 501 AND 600 THEN '501-600ms'
                        WHEN latency BETWEEN 601 AND 700 THEN '601-700ms'
                        WHEN latency BETWEEN 701 AND 800 THEN '701-800ms'
                        WHEN latency BETWEEN 801 AND 900 THEN '801-900ms'
                        WHEN latency BETWEEN 901 AND 1000 THEN '901-1000ms'
                        ELSE '+1s'
                    END as latency
                FROM node_info
                WHERE deprecated = FALSE AND
                    client_name IS NOT NULL AND
                    last_connected > CURRENT_TIMESTAMP - ($1 * INTERVAL '1 DAY')
            ) as t
            GROUP BY t.latency
            ORDER BY cnt DESC
            "#,
        )
        .bind(self.activity_window_days())
        .fetch_all(self.pool())
        .await?;
        Ok(rows
            .iter()
            .map(|row| (row.get("latency_range"), row.get("cnt")))
            .collect())
    }

    pub async fn get_deprecated_count(&self) -> Result<i64, StoreError> {
        let count: i64 = sqlx::query(
            "SELECT count(deprecated) as cnt FROM node_info WHERE deprecated = TRUE",
        )
        .fetch_one(self.pool())
        .await?
        .get("cnt");
        Ok(count)
    }

    pub async fn get_non_deprecated_count(&self) -> Result<i64, StoreError> {
        let count: i64 =
            sqlx::query("SELECT count(deprecated) as cnt FROM node_info WHERE deprecated = FALSE")
                .fetch_one(self.pool())
                .await?
                .get("cnt");
        Ok(count)
    }
}
