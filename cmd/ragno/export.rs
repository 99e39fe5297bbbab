use ethereum_types::H256;
use ragno_common::types::DiscoveredRecord;
use std::collections::HashMap;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

const CSV_HEADER: &str = "node_id,last_seen,ip,tcp,udp,seq,pubkey,record";

/// Accumulated discovery observations, newest per node.
pub struct RecordSet {
    records: HashMap<H256, DiscoveredRecord>,
}

impl RecordSet {
    pub fn new() -> Self {
        Self {
            records: HashMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Keeps the freshest observation per node; a record carrying a signed
    /// blob wins over one without.
    pub fn insert(&mut self, record: DiscoveredRecord) {
        let node_id = record.node.node_id();
        match self.records.get_mut(&node_id) {
            Some(existing) => {
                if record.seq >= existing.seq {
                    let enr = record.enr.clone().or_else(|| existing.enr.clone());
                    *existing = record;
                    existing.enr = enr;
                } else {
                    existing.last_seen = record.last_seen;
                }
            }
            None => {
                self.records.insert(node_id, record);
            }
        }
    }

    /// Rewrites the whole set as a CSV file.
    pub fn flush_csv(&self, path: &Path) -> std::io::Result<()> {
        let mut writer = BufWriter::new(File::create(path)?);
        writeln!(writer, "{CSV_HEADER}")?;
        for (node_id, record) in &self.records {
            let node = &record.node;
            writeln!(
                writer,
                "{:x},{},{},{},{},{},{},{}",
                node_id,
                record.last_seen.to_rfc3339(),
                node.ip,
                node.tcp_port,
                node.udp_port,
                record.seq,
                hex::encode(node.public_key),
                record.enr.clone().unwrap_or_else(|| node.enode_url()),
            )?;
        }
        writer.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ethereum_types::H512;
    use ragno_common::types::Node;

    fn record(byte: u8, seq: u64) -> DiscoveredRecord {
        let node = Node::new("1.2.3.4".parse().unwrap(), 30303, 30303, H512::repeat_byte(byte));
        DiscoveredRecord::from_node(node, seq, None)
    }

    #[test]
    fn insert_keeps_newest_seq() {
        let mut set = RecordSet::new();
        set.insert(record(1, 5));
        set.insert(record(1, 3));
        set.insert(record(2, 0));
        assert_eq!(set.len(), 2);
        let node_id = record(1, 0).node.node_id();
        assert_eq!(set.records[&node_id].seq, 5);
    }

    #[test]
    fn csv_flush_writes_header_and_rows() {
        let mut set = RecordSet::new();
        set.insert(record(1, 1));

        let dir = std::env::temp_dir().join("ragno-export-test");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("records.csv");
        set.flush_csv(&path).unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        let mut lines = content.lines();
        assert_eq!(lines.next(), Some(CSV_HEADER));
        assert_eq!(lines.count(), 1);
        std::fs::remove_file(&path).unwrap();
    }
}
