//! Bounded packet history shared between the capture consumer and readers.
use crossbeam::channel::{self, Receiver, Sender, TrySendError};
use std::collections::VecDeque;
use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::Path;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::analyser::containers::PacketRecord;

pub const DEFAULT_CAPACITY: usize = 1000;

/// Queue depth per subscriber before notifications are dropped.
const SUBSCRIBER_BACKLOG: usize = 1024;

const PCAP_MAGIC: u32 = 0xa1b2_c3d4;
const PCAP_SNAPLEN: u32 = 65535;
const LINKTYPE_ETHERNET: u32 = 1;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StoreEvent {
    Appended(u64),
    CountChanged(usize),
    Cleared,
}

struct Inner {
    records: VecDeque<Arc<PacketRecord>>,
    next_id: u64,
    subscribers: Vec<Sender<StoreEvent>>,
}

/// Append-only, capacity-bounded record history.
///
/// Only the consumer side appends. Once the capacity is exceeded the oldest
/// half is dropped in one go, so appends stay amortized O(1) and survivors
/// keep their order. Records handed out are shared, never rewritten.
pub struct PacketStore {
    capacity: usize,
    inner: RwLock<Inner>,
}

impl Default for PacketStore {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl PacketStore {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(2);
        Self {
            capacity,
            inner: RwLock::new(Inner {
                records: VecDeque::with_capacity(capacity + 1),
                next_id: 1,
                subscribers: Vec::new(),
            }),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    // A panic while holding the lock cannot leave the deque half-updated, so
    // a poisoned lock is still safe to use.
    fn read(&self) -> RwLockReadGuard<'_, Inner> {
        self.inner.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, Inner> {
        self.inner.write().unwrap_or_else(|e| e.into_inner())
    }

    /// Stores `record` under a fresh id and returns that id.
    pub fn append(&self, mut record: PacketRecord) -> u64 {
        let mut inner = self.write();
        let id = inner.next_id;
        inner.next_id += 1;
        record.id = id;
        inner.records.push_back(Arc::new(record));

        if inner.records.len() > self.capacity {
            let evict = self.capacity / 2;
            inner.records.drain(..evict);
            log::debug!("Packet store full, evicted {evict} oldest records");
        }

        let count = inner.records.len();
        notify(&mut inner.subscribers, StoreEvent::Appended(id));
        notify(&mut inner.subscribers, StoreEvent::CountChanged(count));
        id
    }

    pub fn clear(&self) {
        let mut inner = self.write();
        inner.records.clear();
        notify(&mut inner.subscribers, StoreEvent::Cleared);
        notify(&mut inner.subscribers, StoreEvent::CountChanged(0));
    }

    pub fn len(&self) -> usize {
        self.read().records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn select_by_id(&self, id: u64) -> Option<Arc<PacketRecord>> {
        let inner = self.read();
        // Ids are assigned in append order, so the deque is sorted by id
        inner
            .records
            .binary_search_by_key(&id, |r| r.id)
            .ok()
            .map(|index| Arc::clone(&inner.records[index]))
    }

    /// Current contents, oldest first.
    pub fn snapshot(&self) -> Vec<Arc<PacketRecord>> {
        self.read().records.iter().cloned().collect()
    }

    /// Records with an id greater than `after`, oldest first.
    pub fn since(&self, after: u64) -> Vec<Arc<PacketRecord>> {
        let inner = self.read();
        let start = inner.records.partition_point(|r| r.id <= after);
        inner.records.range(start..).cloned().collect()
    }

    /// Notifications for every later append, clear and count change.
    ///
    /// A subscriber that falls more than a backlog behind misses events; it
    /// can always resynchronize with [`PacketStore::since`].
    pub fn subscribe(&self) -> Receiver<StoreEvent> {
        let (tx, rx) = channel::bounded(SUBSCRIBER_BACKLOG);
        self.write().subscribers.push(tx);
        rx
    }

    /// Writes captured records as a classic pcap file and returns how many were written.
    ///
    /// Synthetic records (local monitor, demonstration) carry placeholder
    /// headers and are left out.
    pub fn export<W: Write>(&self, writer: W) -> io::Result<usize> {
        let records: Vec<_> = self.snapshot().into_iter().filter(|r| !r.origin.is_synthetic()).collect();
        write_pcap(writer, &records)
    }

    pub fn export_to_file(&self, path: &Path) -> io::Result<usize> {
        let file = File::create(path)?;
        let written = self.export(BufWriter::new(file))?;
        log::info!("Exported {written} packets to {}", path.display());
        Ok(written)
    }
}

fn notify(subscribers: &mut Vec<Sender<StoreEvent>>, event: StoreEvent) {
    subscribers.retain(|tx| match tx.try_send(event.clone()) {
        Ok(()) | Err(TrySendError::Full(_)) => true,
        Err(TrySendError::Disconnected(_)) => false,
    });
}

fn write_pcap<W: Write>(mut writer: W, records: &[Arc<PacketRecord>]) -> io::Result<usize> {
    writer.write_all(&PCAP_MAGIC.to_le_bytes())?;
    writer.write_all(&2u16.to_le_bytes())?;
    writer.write_all(&4u16.to_le_bytes())?;
    writer.write_all(&0i32.to_le_bytes())?; // thiszone
    writer.write_all(&0u32.to_le_bytes())?; // sigfigs
    writer.write_all(&PCAP_SNAPLEN.to_le_bytes())?;
    writer.write_all(&LINKTYPE_ETHERNET.to_le_bytes())?;

    for record in records {
        let seconds = record.timestamp.timestamp().max(0) as u32;
        let micros = record.timestamp.timestamp_subsec_micros().min(999_999);
        let captured = record.raw_bytes.len().min(PCAP_SNAPLEN as usize);

        writer.write_all(&seconds.to_le_bytes())?;
        writer.write_all(&micros.to_le_bytes())?;
        writer.write_all(&(captured as u32).to_le_bytes())?;
        writer.write_all(&(record.length as u32).to_le_bytes())?;
        writer.write_all(&record.raw_bytes[..captured])?;
    }

    writer.flush()?;
    Ok(records.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analyser::containers::{synthetic_frame_bytes, FrameOrigin, RecordParts};
    use chrono::{TimeZone, Utc};
    use std::net::Ipv4Addr;

    fn record(tag: u8, origin: FrameOrigin) -> PacketRecord {
        PacketRecord::new(RecordParts {
            timestamp: Utc.timestamp_opt(1_700_000_000, 250_000_000).unwrap(),
            source_ip: Ipv4Addr::new(10, 0, 0, tag),
            dest_ip: Ipv4Addr::new(10, 0, 1, tag),
            ports: Some((1000, 80)),
            protocol_name: "TCP".into(),
            raw_bytes: vec![tag; 60],
            origin,
        })
    }

    #[test]
    fn overflow_evicts_oldest_half_in_order() {
        let store = PacketStore::new(1000);
        for i in 0..1001u32 {
            store.append(record((i % 250) as u8, FrameOrigin::Wire));
        }

        assert!(store.len() <= 1000);
        assert_eq!(store.len(), 501);
        let ids: Vec<u64> = store.snapshot().iter().map(|r| r.id).collect();
        let expected: Vec<u64> = (501..=1001).collect();
        assert_eq!(ids, expected);
    }

    #[test]
    fn select_and_since() {
        let store = PacketStore::new(4);
        for i in 0..5 {
            store.append(record(i, FrameOrigin::Wire));
        }
        // 5 > 4: ids 1 and 2 were evicted
        assert!(store.select_by_id(2).is_none());
        assert_eq!(store.select_by_id(4).unwrap().source_ip, Ipv4Addr::new(10, 0, 0, 3));

        let newer: Vec<u64> = store.since(3).iter().map(|r| r.id).collect();
        assert_eq!(newer, vec![4, 5]);
    }

    #[test]
    fn clear_keeps_ids_increasing() {
        let store = PacketStore::default();
        store.append(record(1, FrameOrigin::Wire));
        store.clear();
        assert!(store.is_empty());
        assert_eq!(store.append(record(2, FrameOrigin::Wire)), 2);
    }

    #[test]
    fn subscribers_see_appends_and_clears() {
        let store = PacketStore::default();
        let events = store.subscribe();
        let dropped = store.subscribe();
        drop(dropped);

        store.append(record(1, FrameOrigin::Wire));
        store.clear();

        let seen: Vec<StoreEvent> = events.try_iter().collect();
        assert_eq!(
            seen,
            vec![
                StoreEvent::Appended(1),
                StoreEvent::CountChanged(1),
                StoreEvent::Cleared,
                StoreEvent::CountChanged(0),
            ]
        );
        assert_eq!(store.read().subscribers.len(), 1);
    }

    #[test]
    fn export_writes_pcap_and_skips_synthetic() {
        let store = PacketStore::default();
        store.append(record(7, FrameOrigin::Wire));
        let mut synthetic = record(8, FrameOrigin::LocalMonitor);
        synthetic.raw_bytes = synthetic_frame_bytes("local");
        store.append(synthetic);
        store.append(record(9, FrameOrigin::Reconstructed));

        let mut out = Vec::new();
        assert_eq!(store.export(&mut out).unwrap(), 2);

        assert_eq!(out.len(), 24 + 2 * (16 + 60));
        assert_eq!(&out[..4], &[0xd4, 0xc3, 0xb2, 0xa1]);
        assert_eq!(u32::from_le_bytes(out[20..24].try_into().unwrap()), 1);

        let rec = &out[24..];
        assert_eq!(u32::from_le_bytes(rec[0..4].try_into().unwrap()), 1_700_000_000);
        assert_eq!(u32::from_le_bytes(rec[4..8].try_into().unwrap()), 250_000);
        assert_eq!(u32::from_le_bytes(rec[8..12].try_into().unwrap()), 60);
        assert_eq!(u32::from_le_bytes(rec[12..16].try_into().unwrap()), 60);
        assert_eq!(rec[16], 7);
        assert_eq!(out[24 + 76 + 16], 9);
    }

    #[test]
    fn export_to_file_round_trips_through_reader() {
        let store = PacketStore::default();
        store.append(record(3, FrameOrigin::Wire));
        let file = tempfile::NamedTempFile::new().unwrap();
        assert_eq!(store.export_to_file(file.path()).unwrap(), 1);

        let bytes = std::fs::read(file.path()).unwrap();
        let mut reader = crate::capture::pcap_stream::PcapStreamReader::new(&bytes[..]);
        let frame = reader.next_frame().unwrap().unwrap();
        assert_eq!(frame.data, vec![3u8; 60]);
        assert!(reader.next_frame().unwrap().is_none());
    }
}
