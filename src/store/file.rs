//! Slotted node files
//!
//! Node records are stored at fixed offsets derived from their id, so a
//! lookup is one seek. Every slot starts with the record's occupancy byte
//! followed by the node buffer; a slot whose flag byte is still zero has
//! never been written and reads back as [`TreeError::UnknownNode`]. Ids are
//! never recycled, deleted slots are simply zeroed again.
//!
//! Two layouts cover the two payload shapes:
//!
//! - [`SlottedNodeFile`]: one file, slots sized for the full in-memory
//!   record. The right choice when values are no wider than links.
//! - [`SplitNodeFile`]: wide leaf values would blow up internal slots too
//!   (payload slots are uniform within a node file), so the node structure
//!   is written link-narrow to the main file and leaf values go to a side
//!   file at `(id * branching + index) * value_length`.

use crate::node::{build_layout, NodeId, NodeKind, NodeLayout};
use crate::{Result, TreeError};
use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::io::{ErrorKind, Read, Seek, SeekFrom, Write};
use std::path::Path;
use std::sync::Arc;

/// Persistent record storage keyed by node id
pub trait NodeFileStorage: Send + Sync {
    /// Write the record into the slot for `id`
    fn store(&self, id: NodeId, record: &[u8]) -> Result<()>;

    /// Read the record stored for `id`
    fn load(&self, id: NodeId) -> Result<Vec<u8>>;

    /// Zero the slot for `id`; later loads fail with `UnknownNode`
    fn delete(&self, id: NodeId) -> Result<()>;

    /// Force written slots to stable storage
    fn sync(&self) -> Result<()>;
}

fn open_rw(path: &Path) -> Result<File> {
    Ok(OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .open(path)?)
}

fn read_slot(file: &Mutex<File>, offset: u64, len: usize, id: NodeId) -> Result<Vec<u8>> {
    let mut slot = vec![0u8; len];
    let mut file = file.lock();
    file.seek(SeekFrom::Start(offset))?;
    match file.read_exact(&mut slot) {
        Ok(()) => Ok(slot),
        // reading past the end means the slot was never written
        Err(err) if err.kind() == ErrorKind::UnexpectedEof => Err(TreeError::UnknownNode(id)),
        Err(err) => Err(err.into()),
    }
}

fn write_slot(file: &Mutex<File>, offset: u64, slot: &[u8]) -> Result<()> {
    let mut file = file.lock();
    file.seek(SeekFrom::Start(offset))?;
    file.write_all(slot)?;
    Ok(())
}

/// One file, one slot per id, slots sized for the widest record
pub struct SlottedNodeFile {
    file: Mutex<File>,
    layout: Arc<dyn NodeLayout>,
    slot_size: usize,
}

impl SlottedNodeFile {
    /// Open or create the node file at `path`
    pub fn open(path: &Path, layout: Arc<dyn NodeLayout>) -> Result<Self> {
        let file = open_rw(path)?;
        let slot_size = 1 + layout.record_length(layout.branching());
        Ok(Self {
            file: Mutex::new(file),
            layout,
            slot_size,
        })
    }

    fn offset(&self, id: NodeId) -> u64 {
        id * (self.slot_size as u64)
    }
}

impl NodeFileStorage for SlottedNodeFile {
    fn store(&self, id: NodeId, record: &[u8]) -> Result<()> {
        if record.len() > self.slot_size {
            return Err(TreeError::Corruption(format!(
                "record of {} bytes for node {} exceeds the {} byte slot",
                record.len(),
                id,
                self.slot_size
            )));
        }
        let mut slot = vec![0u8; self.slot_size];
        slot[..record.len()].copy_from_slice(record);
        write_slot(&self.file, self.offset(id), &slot)
    }

    fn load(&self, id: NodeId) -> Result<Vec<u8>> {
        let mut slot = read_slot(&self.file, self.offset(id), self.slot_size, id)?;
        if slot[1] == 0 {
            return Err(TreeError::UnknownNode(id));
        }
        let occupancy = slot[0] as usize;
        if occupancy > self.layout.branching() {
            return Err(TreeError::Corruption(format!(
                "slot for node {} claims occupancy {} beyond branching {}",
                id,
                occupancy,
                self.layout.branching()
            )));
        }
        slot.truncate(1 + self.layout.buffer_length(occupancy));
        Ok(slot)
    }

    fn delete(&self, id: NodeId) -> Result<()> {
        let slot = vec![0u8; self.slot_size];
        write_slot(&self.file, self.offset(id), &slot)
    }

    fn sync(&self) -> Result<()> {
        self.file.lock().sync_all()?;
        Ok(())
    }
}

/// Node structure in a link-narrow main file, leaf values in a side file
pub struct SplitNodeFile {
    main: Mutex<File>,
    values: Mutex<File>,
    /// In-memory layout with value-wide payload slots
    wide: Arc<dyn NodeLayout>,
    /// On-disk layout with link-wide payload slots
    narrow: Arc<dyn NodeLayout>,
    value_length: usize,
    main_slot: usize,
}

impl SplitNodeFile {
    /// Open or create the main node file and the value side file
    pub fn open(main_path: &Path, values_path: &Path, wide: Arc<dyn NodeLayout>) -> Result<Self> {
        let narrow = build_layout(
            wide.strategy(),
            wide.branching(),
            wide.key_length(),
            wide.link_length(),
            wide.link_length(),
        )?;
        let main_slot = 1 + narrow.record_length(narrow.branching());
        Ok(Self {
            main: Mutex::new(open_rw(main_path)?),
            values: Mutex::new(open_rw(values_path)?),
            value_length: wide.payload_length(),
            wide,
            narrow,
            main_slot,
        })
    }

    fn main_offset(&self, id: NodeId) -> u64 {
        id * (self.main_slot as u64)
    }

    fn values_offset(&self, id: NodeId) -> u64 {
        id * (self.wide.branching() as u64) * (self.value_length as u64)
    }
}

impl NodeFileStorage for SplitNodeFile {
    fn store(&self, id: NodeId, record: &[u8]) -> Result<()> {
        if record.len() < 2 {
            return Err(TreeError::Corruption(format!(
                "record for node {} is too short to carry a header",
                id
            )));
        }
        let occupancy = record[0] as usize;
        let kind = NodeKind::from_flag(record[1])?;
        if occupancy > self.wide.branching() {
            return Err(TreeError::Corruption(format!(
                "record for node {} claims occupancy {} beyond branching {}",
                id,
                occupancy,
                self.wide.branching()
            )));
        }
        let buffer = &record[1..];
        if buffer.len() != self.wide.buffer_length(occupancy) {
            return Err(TreeError::Corruption(format!(
                "record for node {} has {} buffer bytes, layout expects {}",
                id,
                buffer.len(),
                self.wide.buffer_length(occupancy)
            )));
        }

        let key_len = self.wide.key_length();
        let link_len = self.wide.link_length();
        let mut slot = vec![0u8; self.main_slot];
        slot[0] = record[0];
        let narrow_buf = &mut slot[1..1 + self.narrow.buffer_length(occupancy)];
        narrow_buf[0] = record[1];

        let mut leaf_values = Vec::new();
        for index in 0..occupancy {
            let key_at = self.wide.key_offset(index);
            let narrow_key_at = self.narrow.key_offset(index);
            narrow_buf[narrow_key_at..narrow_key_at + key_len]
                .copy_from_slice(&buffer[key_at..key_at + key_len]);

            let payload_at = self.wide.payload_offset(index);
            match kind {
                NodeKind::Internal => {
                    let narrow_payload_at = self.narrow.payload_offset(index);
                    narrow_buf[narrow_payload_at..narrow_payload_at + link_len]
                        .copy_from_slice(&buffer[payload_at..payload_at + link_len]);
                }
                NodeKind::Leaf => {
                    leaf_values.extend_from_slice(&buffer[payload_at..payload_at + self.value_length]);
                }
            }
        }

        let link_at = self.wide.link_offset(occupancy);
        let narrow_link_at = self.narrow.link_offset(occupancy);
        narrow_buf[narrow_link_at..narrow_link_at + link_len]
            .copy_from_slice(&buffer[link_at..link_at + link_len]);

        write_slot(&self.main, self.main_offset(id), &slot)?;
        if kind == NodeKind::Leaf && !leaf_values.is_empty() {
            write_slot(&self.values, self.values_offset(id), &leaf_values)?;
        }
        Ok(())
    }

    fn load(&self, id: NodeId) -> Result<Vec<u8>> {
        let slot = read_slot(&self.main, self.main_offset(id), self.main_slot, id)?;
        if slot[1] == 0 {
            return Err(TreeError::UnknownNode(id));
        }
        let occupancy = slot[0] as usize;
        let kind = NodeKind::from_flag(slot[1])?;
        if occupancy > self.wide.branching() {
            return Err(TreeError::Corruption(format!(
                "slot for node {} claims occupancy {} beyond branching {}",
                id,
                occupancy,
                self.wide.branching()
            )));
        }
        let narrow_buf = &slot[1..1 + self.narrow.buffer_length(occupancy)];

        let key_len = self.wide.key_length();
        let link_len = self.wide.link_length();
        let mut buffer = vec![0u8; self.wide.buffer_length(occupancy)];
        buffer[0] = slot[1];

        for index in 0..occupancy {
            let key_at = self.wide.key_offset(index);
            let narrow_key_at = self.narrow.key_offset(index);
            buffer[key_at..key_at + key_len]
                .copy_from_slice(&narrow_buf[narrow_key_at..narrow_key_at + key_len]);

            if kind == NodeKind::Internal {
                let payload_at = self.wide.payload_offset(index);
                let narrow_payload_at = self.narrow.payload_offset(index);
                buffer[payload_at..payload_at + link_len]
                    .copy_from_slice(&narrow_buf[narrow_payload_at..narrow_payload_at + link_len]);
            }
        }

        if kind == NodeKind::Leaf && occupancy > 0 {
            let wanted = occupancy * self.value_length;
            let values = match read_slot(&self.values, self.values_offset(id), wanted, id) {
                Ok(values) => values,
                Err(TreeError::UnknownNode(_)) => {
                    return Err(TreeError::Corruption(format!(
                        "value file is truncated for node {}",
                        id
                    )))
                }
                Err(err) => return Err(err),
            };
            for index in 0..occupancy {
                let payload_at = self.wide.payload_offset(index);
                let from = index * self.value_length;
                buffer[payload_at..payload_at + self.value_length]
                    .copy_from_slice(&values[from..from + self.value_length]);
            }
        }

        let link_at = self.wide.link_offset(occupancy);
        let narrow_link_at = self.narrow.link_offset(occupancy);
        buffer[link_at..link_at + link_len]
            .copy_from_slice(&narrow_buf[narrow_link_at..narrow_link_at + link_len]);

        let mut record = Vec::with_capacity(1 + buffer.len());
        record.push(slot[0]);
        record.extend_from_slice(&buffer);
        Ok(record)
    }

    fn delete(&self, id: NodeId) -> Result<()> {
        // zeroing the main slot is enough, stale value bytes are unreachable
        let slot = vec![0u8; self.main_slot];
        write_slot(&self.main, self.main_offset(id), &slot)
    }

    fn sync(&self) -> Result<()> {
        self.main.lock().sync_all()?;
        self.values.lock().sync_all()?;
        Ok(())
    }
}
