//! Map operations: stateless functions parameterized by a [`MapContext`] and
//! the [`Filer`] of the chunk the table lives in. One set of logic serves
//! every map instance in the process; nothing here holds state between
//! calls.
//!
//! Callers serialize structural mutation per map through their own lock
//! (striped by convention). Reads race only with growth of the backing
//! region, which the region already guards.

use eyre::{bail, ensure, eyre, Result};
use zerocopy::{FromBytes, IntoBytes};

use crate::storage::Filer;

use super::{
    fnv1a64, MapContext, MapHeader, MAP_HEADER_SIZE, MODE_FILLED, MODE_NULL, MODE_SKIP,
};

/// Bytes needed for a map with the given geometry.
pub fn compute_filer_size(
    capacity: u32,
    key_size: u32,
    variable_key: bool,
    payload_size: u32,
    variable_payload: bool,
) -> u64 {
    let key_area = if variable_key { 2 + key_size as u64 } else { key_size as u64 };
    let payload_area = if variable_payload {
        2 + payload_size as u64
    } else {
        payload_size as u64
    };
    MAP_HEADER_SIZE + capacity as u64 * (1 + key_area + payload_area)
}

/// Lay out a fresh, empty table in the filer's chunk.
pub fn create(
    filer: &Filer,
    capacity: u32,
    key_size: u32,
    variable_key: bool,
    payload_size: u32,
    variable_payload: bool,
) -> Result<MapContext> {
    ensure!(capacity > 0, "map capacity must be at least 1");
    ensure!(key_size > 0, "map key size must be at least 1");
    ensure!(
        !variable_key || key_size <= u16::MAX as u32,
        "variable keys are length-prefixed with a u16; key size {} is too large",
        key_size
    );
    ensure!(
        !variable_payload || payload_size <= u16::MAX as u32,
        "variable payloads are length-prefixed with a u16; payload size {} is too large",
        payload_size
    );

    let required = compute_filer_size(capacity, key_size, variable_key, payload_size, variable_payload);
    ensure!(
        required <= filer.length(),
        "map of {} bytes does not fit chunk payload of {} bytes",
        required,
        filer.length()
    );

    let header = MapHeader {
        capacity,
        key_size,
        payload_size,
        key_length_size: if variable_key { 2 } else { 0 },
        payload_length_size: if variable_payload { 2 } else { 0 },
        flags: 0,
        count: 0,
    };
    filer.write_at(0, header.as_bytes())?;

    // The chunk may be recycled space; every slot must start NULL.
    let zeros = [0u8; 4096];
    let mut remaining = required - MAP_HEADER_SIZE;
    let mut offset = MAP_HEADER_SIZE;
    while remaining > 0 {
        let n = remaining.min(zeros.len() as u64);
        filer.write_at(offset, &zeros[..n as usize])?;
        offset += n;
        remaining -= n;
    }

    Ok(MapContext {
        capacity,
        key_size,
        payload_size,
        key_length_size: header.key_length_size,
        payload_length_size: header.payload_length_size,
        count: 0,
    })
}

/// Decode the header of an existing table.
pub fn open(filer: &Filer) -> Result<MapContext> {
    let mut buf = [0u8; MAP_HEADER_SIZE as usize];
    filer.read_at(0, &mut buf)?;
    let header = MapHeader::read_from_bytes(&buf)
        .map_err(|e| eyre!("failed to decode map header: {:?}", e))?;

    ensure!(header.capacity > 0, "map header has zero capacity");
    ensure!(header.key_size > 0, "map header has zero key size");
    ensure!(
        header.key_length_size == 0 || header.key_length_size == 2,
        "map header has unsupported key length size {}",
        header.key_length_size
    );
    ensure!(
        header.payload_length_size == 0 || header.payload_length_size == 2,
        "map header has unsupported payload length size {}",
        header.payload_length_size
    );
    ensure!(
        header.count <= header.capacity,
        "map header count {} exceeds capacity {}",
        header.count,
        header.capacity
    );

    let ctx = MapContext {
        capacity: header.capacity,
        key_size: header.key_size,
        payload_size: header.payload_size,
        key_length_size: header.key_length_size,
        payload_length_size: header.payload_length_size,
        count: header.count,
    };
    ensure!(
        MAP_HEADER_SIZE + ctx.capacity as u64 * ctx.entry_size() <= filer.length(),
        "map table extends past the chunk payload"
    );
    Ok(ctx)
}

/// Insert or overwrite. Returns the slot index the key landed in. Re-adding
/// an existing key rewrites its payload in place; the table layout and
/// `count` are untouched.
pub fn add(filer: &Filer, ctx: &mut MapContext, mode: u8, key: &[u8], payload: &[u8]) -> Result<u32> {
    ctx.validate_key(key)?;
    ctx.validate_payload(payload)?;

    let start = (fnv1a64(key) % ctx.capacity as u64) as u32;
    let mut first_free: Option<u32> = None;

    for i in 0..ctx.capacity {
        let slot = (start + i) % ctx.capacity;
        match filer.read_u8_at(ctx.slot_offset(slot))? {
            MODE_NULL => {
                let target = first_free.unwrap_or(slot);
                write_entry(filer, ctx, target, mode, key, payload)?;
                bump_count(filer, ctx, 1)?;
                return Ok(target);
            }
            MODE_SKIP => {
                if first_free.is_none() {
                    first_free = Some(slot);
                }
            }
            MODE_FILLED => {
                if key_matches(filer, ctx, slot, key)? {
                    write_payload(filer, ctx, slot, payload)?;
                    return Ok(slot);
                }
            }
            other => bail!("map slot {} has corrupt mode byte {}", slot, other),
        }
    }

    if let Some(target) = first_free {
        write_entry(filer, ctx, target, mode, key, payload)?;
        bump_count(filer, ctx, 1)?;
        return Ok(target);
    }
    bail!(
        "map over capacity: {} live of {} slots and no tombstone to reuse (grow must run first)",
        ctx.count(),
        ctx.capacity
    )
}

/// Slot index holding `key`, if present.
pub fn get(filer: &Filer, ctx: &MapContext, key: &[u8]) -> Result<Option<u32>> {
    ctx.validate_key(key)?;

    let start = (fnv1a64(key) % ctx.capacity as u64) as u32;
    for i in 0..ctx.capacity {
        let slot = (start + i) % ctx.capacity;
        match filer.read_u8_at(ctx.slot_offset(slot))? {
            MODE_NULL => return Ok(None),
            MODE_SKIP => {}
            MODE_FILLED => {
                if key_matches(filer, ctx, slot, key)? {
                    return Ok(Some(slot));
                }
            }
            other => bail!("map slot {} has corrupt mode byte {}", slot, other),
        }
    }
    Ok(None)
}

pub fn contains(filer: &Filer, ctx: &MapContext, key: &[u8]) -> Result<bool> {
    Ok(get(filer, ctx, key)?.is_some())
}

/// The key stored in a slot, or `None` when the slot is empty or tombstoned.
pub fn key_at(filer: &Filer, ctx: &MapContext, index: u32) -> Result<Option<Vec<u8>>> {
    ensure!(index < ctx.capacity, "slot index {} out of range", index);
    match filer.read_u8_at(ctx.slot_offset(index))? {
        MODE_FILLED => Ok(Some(read_key(filer, ctx, index)?)),
        MODE_NULL | MODE_SKIP => Ok(None),
        other => bail!("map slot {} has corrupt mode byte {}", index, other),
    }
}

/// The payload of a known-live slot.
pub fn payload_at(filer: &Filer, ctx: &MapContext, index: u32) -> Result<Vec<u8>> {
    ensure!(index < ctx.capacity, "slot index {} out of range", index);
    let mode = filer.read_u8_at(ctx.slot_offset(index))?;
    ensure!(
        mode == MODE_FILLED,
        "slot {} is not filled (mode {})",
        index,
        mode
    );
    read_payload(filer, ctx, index)
}

pub fn get_payload(filer: &Filer, ctx: &MapContext, key: &[u8]) -> Result<Option<Vec<u8>>> {
    match get(filer, ctx, key)? {
        Some(index) => Ok(Some(read_payload(filer, ctx, index)?)),
        None => Ok(None),
    }
}

/// Rewrite a live slot's payload in place. The skip list leans on this to
/// update user payloads without disturbing the pointer column.
pub fn set_payload_at(filer: &Filer, ctx: &MapContext, index: u32, payload: &[u8]) -> Result<()> {
    ensure!(index < ctx.capacity, "slot index {} out of range", index);
    ctx.validate_payload(payload)?;
    write_payload(filer, ctx, index, payload)
}

/// Tombstone the slot holding `key`. Returns whether the key was present.
pub fn remove(filer: &Filer, ctx: &mut MapContext, key: &[u8]) -> Result<bool> {
    match get(filer, ctx, key)? {
        Some(index) => {
            filer.write_u8_at(ctx.slot_offset(index), MODE_SKIP)?;
            bump_count(filer, ctx, -1)?;
            Ok(true)
        }
        None => Ok(false),
    }
}

pub fn is_full(ctx: &MapContext) -> bool {
    ctx.count() >= ctx.capacity
}

/// Doubling policy. The grow protocol allocates the next map with this
/// capacity and copies live entries forward.
pub fn next_grow_size(ctx: &MapContext) -> u32 {
    ctx.capacity.saturating_mul(2)
}

/// Re-add every live entry of `from` into `to`, skipping empties and
/// tombstones. The optional callback observes `(from_index, to_index)` for
/// every migrated entry so layered structures can remap slot references.
pub fn copy_to(
    from_filer: &Filer,
    from_ctx: &MapContext,
    to_filer: &Filer,
    to_ctx: &mut MapContext,
    mut on_copied: Option<&mut dyn FnMut(u32, u32)>,
) -> Result<()> {
    for index in 0..from_ctx.capacity {
        match from_filer.read_u8_at(from_ctx.slot_offset(index))? {
            MODE_NULL | MODE_SKIP => {}
            MODE_FILLED => {
                let key = read_key(from_filer, from_ctx, index)?;
                let payload = read_payload(from_filer, from_ctx, index)?;
                let to_index = add(to_filer, to_ctx, MODE_FILLED, &key, &payload)?;
                if let Some(cb) = on_copied.as_deref_mut() {
                    cb(index, to_index);
                }
            }
            other => bail!("map slot {} has corrupt mode byte {}", index, other),
        }
    }
    Ok(())
}

/// Visit every live key in slot order. The visitor returns `Ok(false)` to
/// stop the scan early; the table is never modified.
pub fn stream_keys(
    filer: &Filer,
    ctx: &MapContext,
    mut visitor: impl FnMut(&[u8]) -> Result<bool>,
) -> Result<bool> {
    for index in 0..ctx.capacity {
        if filer.read_u8_at(ctx.slot_offset(index))? == MODE_FILLED {
            let key = read_key(filer, ctx, index)?;
            if !visitor(&key)? {
                return Ok(false);
            }
        }
    }
    Ok(true)
}

/// Visit every live `(key, payload)` pair in slot order.
pub fn stream(
    filer: &Filer,
    ctx: &MapContext,
    mut visitor: impl FnMut(&[u8], &[u8]) -> Result<bool>,
) -> Result<bool> {
    for index in 0..ctx.capacity {
        if filer.read_u8_at(ctx.slot_offset(index))? == MODE_FILLED {
            let key = read_key(filer, ctx, index)?;
            let payload = read_payload(filer, ctx, index)?;
            if !visitor(&key, &payload)? {
                return Ok(false);
            }
        }
    }
    Ok(true)
}

fn key_matches(filer: &Filer, ctx: &MapContext, index: u32, key: &[u8]) -> Result<bool> {
    let stored = read_key(filer, ctx, index)?;
    Ok(stored == key)
}

fn read_key(filer: &Filer, ctx: &MapContext, index: u32) -> Result<Vec<u8>> {
    let offset = ctx.key_offset(index);
    let len = if ctx.key_length_size == 0 {
        ctx.key_size as usize
    } else {
        let mut prefix = [0u8; 2];
        filer.read_at(offset, &mut prefix)?;
        let len = u16::from_le_bytes(prefix) as usize;
        ensure!(
            len <= ctx.key_size as usize,
            "slot {} key length prefix {} exceeds key size {}",
            index,
            len,
            ctx.key_size
        );
        len
    };
    let mut key = vec![0u8; len];
    filer.read_at(offset + ctx.key_length_size as u64, &mut key)?;
    Ok(key)
}

fn read_payload(filer: &Filer, ctx: &MapContext, index: u32) -> Result<Vec<u8>> {
    let offset = ctx.payload_offset(index);
    let len = if ctx.payload_length_size == 0 {
        ctx.payload_size as usize
    } else {
        let mut prefix = [0u8; 2];
        filer.read_at(offset, &mut prefix)?;
        let len = u16::from_le_bytes(prefix) as usize;
        ensure!(
            len <= ctx.payload_size as usize,
            "slot {} payload length prefix {} exceeds payload size {}",
            index,
            len,
            ctx.payload_size
        );
        len
    };
    let mut payload = vec![0u8; len];
    filer.read_at(offset + ctx.payload_length_size as u64, &mut payload)?;
    Ok(payload)
}

fn write_entry(
    filer: &Filer,
    ctx: &MapContext,
    index: u32,
    mode: u8,
    key: &[u8],
    payload: &[u8],
) -> Result<()> {
    let mut entry = vec![0u8; ctx.entry_size() as usize];
    entry[0] = mode;

    let key_start = 1 + ctx.key_length_size as usize;
    if ctx.key_length_size == 2 {
        entry[1..3].copy_from_slice(&(key.len() as u16).to_le_bytes());
    }
    entry[key_start..key_start + key.len()].copy_from_slice(key);

    let payload_area = (1 + ctx.key_area()) as usize;
    if ctx.payload_length_size == 2 {
        entry[payload_area..payload_area + 2].copy_from_slice(&(payload.len() as u16).to_le_bytes());
    }
    let payload_start = payload_area + ctx.payload_length_size as usize;
    entry[payload_start..payload_start + payload.len()].copy_from_slice(payload);

    filer.write_at(ctx.slot_offset(index), &entry)
}

fn write_payload(filer: &Filer, ctx: &MapContext, index: u32, payload: &[u8]) -> Result<()> {
    let mut area = vec![0u8; ctx.payload_area() as usize];
    if ctx.payload_length_size == 2 {
        area[..2].copy_from_slice(&(payload.len() as u16).to_le_bytes());
    }
    let start = ctx.payload_length_size as usize;
    area[start..start + payload.len()].copy_from_slice(payload);
    filer.write_at(ctx.payload_offset(index), &area)
}

fn bump_count(filer: &Filer, ctx: &mut MapContext, delta: i64) -> Result<()> {
    let count = (ctx.count() as i64 + delta) as u32;
    ctx.set_count(count);
    filer.write_u32_at(16, count)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{ByteRegion, ChunkStore};

    fn map_fixture(capacity: u32, key_size: u32, payload_size: u32) -> (ChunkStore, u64, MapContext) {
        let store = ChunkStore::create(ByteRegion::heap(0)).unwrap();
        let size = compute_filer_size(capacity, key_size, false, payload_size, false);
        let fp = store.new_chunk(size).unwrap();
        let filer = store.filer(fp).unwrap();
        let ctx = create(&filer, capacity, key_size, false, payload_size, false).unwrap();
        (store, fp, ctx)
    }

    #[test]
    fn add_get_remove_round_trip() {
        let (store, fp, mut ctx) = map_fixture(16, 4, 8);
        let filer = store.filer(fp).unwrap();

        add(&filer, &mut ctx, MODE_FILLED, b"abcd", &7u64.to_le_bytes()).unwrap();

        assert!(contains(&filer, &ctx, b"abcd").unwrap());
        assert_eq!(
            get_payload(&filer, &ctx, b"abcd").unwrap().unwrap(),
            7u64.to_le_bytes()
        );
        assert_eq!(ctx.count(), 1);

        assert!(remove(&filer, &mut ctx, b"abcd").unwrap());
        assert!(get(&filer, &ctx, b"abcd").unwrap().is_none());
        assert_eq!(ctx.count(), 0);
        assert!(!remove(&filer, &mut ctx, b"abcd").unwrap());
    }

    #[test]
    fn re_adding_a_key_overwrites_in_place() {
        let (store, fp, mut ctx) = map_fixture(8, 4, 8);
        let filer = store.filer(fp).unwrap();

        let first = add(&filer, &mut ctx, MODE_FILLED, b"samk", &1u64.to_le_bytes()).unwrap();
        let second = add(&filer, &mut ctx, MODE_FILLED, b"samk", &2u64.to_le_bytes()).unwrap();

        assert_eq!(first, second);
        assert_eq!(ctx.count(), 1);
        assert_eq!(
            get_payload(&filer, &ctx, b"samk").unwrap().unwrap(),
            2u64.to_le_bytes()
        );
    }

    #[test]
    fn probing_continues_past_tombstones() {
        let (store, fp, mut ctx) = map_fixture(4, 4, 8);
        let filer = store.filer(fp).unwrap();

        // Fill the table so every key chain collides somewhere, then punch a
        // tombstone in the middle of a chain and look up the keys behind it.
        let keys: Vec<[u8; 4]> = (0u32..4).map(|i| i.to_le_bytes()).collect();
        for key in &keys {
            add(&filer, &mut ctx, MODE_FILLED, key, &0u64.to_le_bytes()).unwrap();
        }
        assert!(is_full(&ctx));

        assert!(remove(&filer, &mut ctx, &keys[1]).unwrap());
        for key in [&keys[0], &keys[2], &keys[3]] {
            assert!(contains(&filer, &ctx, key).unwrap(), "lost key {:?}", key);
        }

        // The tombstone is reused by the next insert.
        add(&filer, &mut ctx, MODE_FILLED, b"newk", &9u64.to_le_bytes()).unwrap();
        assert!(contains(&filer, &ctx, b"newk").unwrap());
        assert_eq!(ctx.count(), 4);
    }

    #[test]
    fn add_into_full_table_is_an_error() {
        let (store, fp, mut ctx) = map_fixture(2, 4, 8);
        let filer = store.filer(fp).unwrap();

        add(&filer, &mut ctx, MODE_FILLED, b"key1", &1u64.to_le_bytes()).unwrap();
        add(&filer, &mut ctx, MODE_FILLED, b"key2", &2u64.to_le_bytes()).unwrap();

        let err = add(&filer, &mut ctx, MODE_FILLED, b"key3", &3u64.to_le_bytes()).unwrap_err();
        assert!(err.to_string().contains("over capacity"));
    }

    #[test]
    fn wrong_key_size_is_rejected() {
        let (store, fp, mut ctx) = map_fixture(8, 4, 8);
        let filer = store.filer(fp).unwrap();

        assert!(add(&filer, &mut ctx, MODE_FILLED, b"toolong", &0u64.to_le_bytes()).is_err());
        assert!(get(&filer, &ctx, b"ab").is_err());
    }

    #[test]
    fn variable_keys_store_their_actual_length() {
        let store = ChunkStore::create(ByteRegion::heap(0)).unwrap();
        let size = compute_filer_size(8, 16, true, 8, false);
        let fp = store.new_chunk(size).unwrap();
        let filer = store.filer(fp).unwrap();
        let mut ctx = create(&filer, 8, 16, true, 8, false).unwrap();

        add(&filer, &mut ctx, MODE_FILLED, b"a", &1u64.to_le_bytes()).unwrap();
        add(&filer, &mut ctx, MODE_FILLED, b"abcdefgh", &2u64.to_le_bytes()).unwrap();

        // A key that is a prefix of another stored key must not alias it.
        assert_eq!(
            get_payload(&filer, &ctx, b"a").unwrap().unwrap(),
            1u64.to_le_bytes()
        );
        assert_eq!(
            get_payload(&filer, &ctx, b"abcdefgh").unwrap().unwrap(),
            2u64.to_le_bytes()
        );
        assert!(get(&filer, &ctx, b"abcd").unwrap().is_none());

        let index = get(&filer, &ctx, b"a").unwrap().unwrap();
        assert_eq!(key_at(&filer, &ctx, index).unwrap().unwrap(), b"a");
    }

    #[test]
    fn grow_scenario_capacity_two_to_four() {
        // Capacity 2, key size 4, payload size 8: add two keys, observe the
        // table is full, grow by copy to capacity 4, and confirm nothing was
        // lost or duplicated.
        let (store, fp, mut ctx) = map_fixture(2, 4, 8);
        let filer = store.filer(fp).unwrap();

        add(&filer, &mut ctx, MODE_FILLED, &[0, 0, 0, 1], &1u64.to_le_bytes()).unwrap();
        add(&filer, &mut ctx, MODE_FILLED, &[0, 0, 0, 2], &2u64.to_le_bytes()).unwrap();
        assert!(is_full(&ctx));

        let grown_capacity = next_grow_size(&ctx);
        assert_eq!(grown_capacity, 4);
        let grown_fp = store
            .new_chunk(compute_filer_size(grown_capacity, 4, false, 8, false))
            .unwrap();
        let grown_filer = store.filer(grown_fp).unwrap();
        let mut grown = create(&grown_filer, grown_capacity, 4, false, 8, false).unwrap();

        copy_to(&filer, &ctx, &grown_filer, &mut grown, None).unwrap();
        store.recycle(fp).unwrap();

        assert_eq!(grown.count(), 2);
        assert_eq!(
            get_payload(&grown_filer, &grown, &[0, 0, 0, 1]).unwrap().unwrap(),
            1u64.to_le_bytes()
        );
        assert_eq!(
            get_payload(&grown_filer, &grown, &[0, 0, 0, 2]).unwrap().unwrap(),
            2u64.to_le_bytes()
        );
    }

    #[test]
    fn stream_keys_stops_when_visitor_says_so() {
        let (store, fp, mut ctx) = map_fixture(16, 4, 8);
        let filer = store.filer(fp).unwrap();
        for i in 0u32..5 {
            add(&filer, &mut ctx, MODE_FILLED, &i.to_le_bytes(), &0u64.to_le_bytes()).unwrap();
        }

        let mut seen = 0;
        let completed = stream_keys(&filer, &ctx, |_| {
            seen += 1;
            Ok(seen < 2)
        })
        .unwrap();

        assert!(!completed);
        assert_eq!(seen, 2);

        let mut all = 0;
        assert!(stream(&filer, &ctx, |_, _| {
            all += 1;
            Ok(true)
        })
        .unwrap());
        assert_eq!(all, 5);
    }

    #[test]
    fn open_rebuilds_context_from_header() {
        let (store, fp, mut ctx) = map_fixture(8, 4, 8);
        let filer = store.filer(fp).unwrap();
        add(&filer, &mut ctx, MODE_FILLED, b"keep", &5u64.to_le_bytes()).unwrap();

        let reopened = open(&filer).unwrap();
        assert_eq!(reopened.capacity, 8);
        assert_eq!(reopened.count(), 1);
        assert_eq!(
            get_payload(&filer, &reopened, b"keep").unwrap().unwrap(),
            5u64.to_le_bytes()
        );
    }

    #[test]
    fn open_rejects_garbage_header() {
        let store = ChunkStore::create(ByteRegion::heap(0)).unwrap();
        let fp = store.new_chunk(256).unwrap();
        let filer = store.filer(fp).unwrap();
        // Never initialized as a map: capacity reads as zero.
        assert!(open(&filer).is_err());
    }
}
