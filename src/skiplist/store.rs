//! Skip-list operations: stateless functions over a [`SkipListMapContext`]
//! and the backing chunk's [`Filer`], mirroring the map layer's shape.
//!
//! All structural mutation on one list must be serialized by the caller's
//! lock, exactly as for the map underneath. The walk logic never tolerates
//! an equal comparison between two distinct slots: keys are unique in the
//! backing map by construction (`add` checks existence first, under the
//! same lock), so equality mid-walk means the chain itself is corrupt.

use eyre::{bail, ensure, Result};
use rand::Rng;
use std::cmp::Ordering;

use crate::map::{self, MODE_FILLED, MODE_NULL, MODE_SKIP};
use crate::storage::Filer;

use super::{column_height, column_size, height_fit, KeyComparator, KeyRange, SkipListMapContext};

const NIL: i32 = -1;

/// Bytes needed for a list holding `max_count` keys. Two extra slots cover
/// the head sentinel and probe slack, matching [`create`].
pub fn compute_filer_size(
    max_count: u32,
    key_size: u32,
    variable_key: bool,
    payload_size: u32,
) -> u64 {
    let capacity = max_count + 2;
    let max_height = height_fit(capacity);
    map::store::compute_filer_size(
        capacity,
        key_size,
        variable_key,
        column_size(max_height) + payload_size,
        false,
    )
}

/// Lay out a fresh list and plant the head sentinel at full height.
pub fn create(
    filer: &Filer,
    max_count: u32,
    head_key: &[u8],
    key_size: u32,
    variable_key: bool,
    payload_size: u32,
    comparator: KeyComparator,
) -> Result<SkipListMapContext> {
    ensure!(max_count > 0, "skip list capacity must be at least 1");

    let capacity = max_count + 2;
    let max_height = height_fit(capacity);
    let mut map_ctx = map::store::create(
        filer,
        capacity,
        key_size,
        variable_key,
        column_size(max_height) + payload_size,
        false,
    )?;

    let column = new_column(max_height, max_height, &vec![0u8; payload_size as usize]);
    let head_index = map::store::add(filer, &mut map_ctx, MODE_FILLED, head_key, &column)?;

    Ok(SkipListMapContext::new(
        map_ctx,
        head_index,
        head_key.to_vec(),
        comparator,
    ))
}

/// Re-open a list created by [`create`]. The head key must resolve or the
/// chunk does not hold a skip list.
pub fn open(filer: &Filer, head_key: &[u8], comparator: KeyComparator) -> Result<SkipListMapContext> {
    let map_ctx = map::store::open(filer)?;
    let max_height = height_fit(map_ctx.capacity);
    ensure!(
        map_ctx.payload_length_size == 0 && map_ctx.payload_size >= column_size(max_height),
        "map payload of {} bytes cannot hold a height-{} pointer column",
        map_ctx.payload_size,
        max_height
    );
    let Some(head_index) = map::store::get(filer, &map_ctx, head_key)? else {
        bail!("invalid skip list chunk: head sentinel not found");
    };
    Ok(SkipListMapContext::new(
        map_ctx,
        head_index,
        head_key.to_vec(),
        comparator,
    ))
}

/// Live keys, excluding the head sentinel.
pub fn count(ctx: &SkipListMapContext) -> u32 {
    ctx.map.count().saturating_sub(1)
}

pub fn is_full(ctx: &SkipListMapContext) -> bool {
    map::store::is_full(&ctx.map)
}

/// Doubling policy in terms of user capacity (sentinel slots excluded).
pub fn next_grow_size(ctx: &SkipListMapContext) -> u32 {
    (ctx.map.capacity - 2).saturating_mul(2)
}

/// Insert `key` or overwrite its payload in place. New keys draw a fresh
/// column and are spliced into every chain level their height covers.
pub fn add(
    filer: &Filer,
    ctx: &mut SkipListMapContext,
    key: &[u8],
    payload: &[u8],
) -> Result<u32> {
    ensure!(
        key != ctx.head_key(),
        "key collides with the reserved head sentinel"
    );
    ensure!(
        payload.len() == ctx.user_payload_size() as usize,
        "payload of {} bytes does not match declared payload size {}",
        payload.len(),
        ctx.user_payload_size()
    );

    if let Some(existing) = map::store::get(filer, &ctx.map, key)? {
        write_user_payload(filer, ctx, existing, payload)?;
        return Ok(existing);
    }

    let height = column_height(ctx.rng().gen::<u64>(), ctx.max_height());
    let column = new_column(ctx.max_height(), height, payload);
    let inserts = map::store::add(filer, &mut ctx.map, MODE_FILLED, key, &column)?;

    let mut level = ctx.max_height() - 1;
    let mut at = ctx.head_index();
    while level > 0 {
        let next = read_level(filer, ctx, at, level)?;
        if next == NIL {
            if level < height {
                write_level(filer, ctx, at, level, inserts as i32)?;
                if level == 1 {
                    write_level(filer, ctx, inserts, 0, at as i32)?;
                }
            }
            level -= 1;
        } else {
            let next = next as u32;
            match (ctx.comparator())(&key_of(filer, ctx, next)?, key) {
                Ordering::Equal => bail!(
                    "skip list walk compared equal at distinct slots {} and {}: chain corrupted",
                    next,
                    inserts
                ),
                Ordering::Less => at = next,
                Ordering::Greater => {
                    if level < height {
                        write_level(filer, ctx, inserts, level, next as i32)?;
                        write_level(filer, ctx, at, level, inserts as i32)?;
                        if level == 1 {
                            write_level(filer, ctx, inserts, 0, at as i32)?;
                            write_level(filer, ctx, next, 0, inserts as i32)?;
                        }
                    }
                    level -= 1;
                }
            }
        }
    }
    Ok(inserts)
}

/// Unlink `key` from every chain level, then drop the backing map entry.
/// Returns whether the key was present.
pub fn remove(filer: &Filer, ctx: &mut SkipListMapContext, key: &[u8]) -> Result<bool> {
    let Some(remove_index) = map::store::get(filer, &ctx.map, key)? else {
        return Ok(false);
    };
    ensure!(
        remove_index != ctx.head_index(),
        "cannot remove the reserved head sentinel"
    );

    let mut level = ctx.max_height() - 1;
    let mut at = ctx.head_index();
    while level > 0 {
        let next = read_level(filer, ctx, at, level)?;
        if next == NIL {
            level -= 1;
        } else if next as u32 == remove_index {
            // `at` is the predecessor at exactly this level; splice and keep
            // descending to find the lower-level predecessors.
            let removes_next = read_level(filer, ctx, remove_index, level)?;
            write_level(filer, ctx, at, level, removes_next)?;
            if level == 1 && removes_next != NIL {
                write_level(filer, ctx, removes_next as u32, 0, at as i32)?;
            }
            level -= 1;
        } else {
            let next = next as u32;
            match (ctx.comparator())(&key_of(filer, ctx, next)?, key) {
                Ordering::Equal => bail!(
                    "skip list walk compared equal at distinct slots {} and {}: chain corrupted",
                    next,
                    remove_index
                ),
                Ordering::Less => at = next,
                Ordering::Greater => level -= 1,
            }
        }
    }

    map::store::remove(filer, &mut ctx.map, key)?;
    Ok(true)
}

/// The smallest user key, or `None` for an empty list.
pub fn get_first(filer: &Filer, ctx: &SkipListMapContext) -> Result<Option<Vec<u8>>> {
    let first = read_level(filer, ctx, ctx.head_index(), 1)?;
    if first == NIL {
        return Ok(None);
    }
    Ok(Some(key_of(filer, ctx, first as u32)?))
}

/// The key immediately after `key` in comparator order, or `None` at the
/// end of the list or when `key` is absent.
pub fn get_next_key(
    filer: &Filer,
    ctx: &SkipListMapContext,
    key: &[u8],
) -> Result<Option<Vec<u8>>> {
    let Some(index) = map::store::get(filer, &ctx.map, key)? else {
        return Ok(None);
    };
    let next = read_level(filer, ctx, index, 1)?;
    if next == NIL {
        return Ok(None);
    }
    Ok(Some(key_of(filer, ctx, next as u32)?))
}

/// The key immediately before `key`, following the level-0 back-link. The
/// head sentinel is never handed out.
pub fn get_prior(filer: &Filer, ctx: &SkipListMapContext, key: &[u8]) -> Result<Option<Vec<u8>>> {
    let Some(index) = map::store::get(filer, &ctx.map, key)? else {
        return Ok(None);
    };
    let prior = read_level(filer, ctx, index, 0)?;
    if prior == NIL || prior as u32 == ctx.head_index() {
        return Ok(None);
    }
    Ok(Some(key_of(filer, ctx, prior as u32)?))
}

/// The user payload stored under `key`.
pub fn get_existing_payload(
    filer: &Filer,
    ctx: &SkipListMapContext,
    key: &[u8],
) -> Result<Option<Vec<u8>>> {
    let Some(index) = map::store::get(filer, &ctx.map, key)? else {
        return Ok(None);
    };
    Ok(Some(read_user_payload(filer, ctx, index)?))
}

/// The same top-down descent as [`add`], without mutating: the stored key
/// at or after where `key` would land. `None` means past the end (or an
/// empty list).
pub fn find_would_insert_at_or_after(
    filer: &Filer,
    ctx: &SkipListMapContext,
    key: &[u8],
) -> Result<Option<Vec<u8>>> {
    if map::store::get(filer, &ctx.map, key)?.is_some() {
        return Ok(Some(key.to_vec()));
    }

    let mut level = ctx.max_height() - 1;
    let mut at = ctx.head_index();
    while level > 0 {
        let next = read_level(filer, ctx, at, level)?;
        if next == NIL {
            if level == 1 {
                break;
            }
            level -= 1;
            continue;
        }
        let next = next as u32;
        match (ctx.comparator())(&key_of(filer, ctx, next)?, key) {
            Ordering::Equal => bail!(
                "skip list walk compared equal at slot {} for an absent key: chain corrupted",
                next
            ),
            Ordering::Less => at = next,
            Ordering::Greater => {
                if level == 1 {
                    break;
                }
                level -= 1;
            }
        }
    }

    let successor = read_level(filer, ctx, at, 1)?;
    if successor == NIL {
        return Ok(None);
    }
    Ok(Some(key_of(filer, ctx, successor as u32)?))
}

/// Visit keys. Without ranges this is a linear pass over the map slots
/// (unordered, sentinel excluded); with ranges each range is seeded by one
/// descent and walked in order along level 1. The visitor returns
/// `Ok(false)` to stop the whole scan.
pub fn stream_keys(
    filer: &Filer,
    ctx: &SkipListMapContext,
    ranges: Option<&[KeyRange]>,
    mut visitor: impl FnMut(&[u8]) -> Result<bool>,
) -> Result<bool> {
    let Some(ranges) = ranges else {
        for index in 0..ctx.map.capacity {
            if index == ctx.head_index() {
                continue;
            }
            if let Some(key) = map::store::key_at(filer, &ctx.map, index)? {
                if !visitor(&key)? {
                    return Ok(false);
                }
            }
        }
        return Ok(true);
    };

    for range in ranges {
        let mut cursor = find_would_insert_at_or_after(filer, ctx, &range.start_inclusive)?;
        while let Some(key) = cursor {
            if !range.contains(&key, ctx.comparator()) {
                break;
            }
            if !visitor(&key)? {
                return Ok(false);
            }
            cursor = get_next_key(filer, ctx, &key)?;
        }
    }
    Ok(true)
}

/// Re-insert every live key of `from` into `to`, rebuilding columns fresh.
/// Heights are re-drawn; the ordering and payloads carry over exactly.
pub fn copy_to(
    from_filer: &Filer,
    from_ctx: &SkipListMapContext,
    to_filer: &Filer,
    to_ctx: &mut SkipListMapContext,
) -> Result<()> {
    for index in 0..from_ctx.map.capacity {
        if index == from_ctx.head_index() {
            continue;
        }
        match from_filer.read_u8_at(from_ctx.map.slot_offset(index))? {
            MODE_NULL | MODE_SKIP => {}
            MODE_FILLED => {
                let key = key_of(from_filer, from_ctx, index)?;
                let payload = read_user_payload(from_filer, from_ctx, index)?;
                add(to_filer, to_ctx, &key, &payload)?;
            }
            other => bail!("map slot {} has corrupt mode byte {}", index, other),
        }
    }
    Ok(())
}

fn new_column(max_height: u8, height: u8, payload: &[u8]) -> Vec<u8> {
    let mut column = vec![0u8; column_size(max_height) as usize + payload.len()];
    column[0] = height;
    for level in 0..max_height as usize {
        column[1 + level * 4..1 + level * 4 + 4].copy_from_slice(&NIL.to_le_bytes());
    }
    column[column_size(max_height) as usize..].copy_from_slice(payload);
    column
}

fn level_offset(ctx: &SkipListMapContext, index: u32, level: u8) -> u64 {
    ctx.map.payload_offset(index) + 1 + level as u64 * 4
}

fn read_level(filer: &Filer, ctx: &SkipListMapContext, index: u32, level: u8) -> Result<i32> {
    filer.read_i32_at(level_offset(ctx, index, level))
}

fn write_level(
    filer: &Filer,
    ctx: &SkipListMapContext,
    index: u32,
    level: u8,
    target: i32,
) -> Result<()> {
    filer.write_i32_at(level_offset(ctx, index, level), target)
}

fn key_of(filer: &Filer, ctx: &SkipListMapContext, index: u32) -> Result<Vec<u8>> {
    match map::store::key_at(filer, &ctx.map, index)? {
        Some(key) => Ok(key),
        None => bail!("skip list pointer targets empty map slot {}", index),
    }
}

fn user_payload_offset(ctx: &SkipListMapContext, index: u32) -> u64 {
    ctx.map.payload_offset(index) + column_size(ctx.max_height()) as u64
}

fn read_user_payload(filer: &Filer, ctx: &SkipListMapContext, index: u32) -> Result<Vec<u8>> {
    let mut payload = vec![0u8; ctx.user_payload_size() as usize];
    filer.read_at(user_payload_offset(ctx, index), &mut payload)?;
    Ok(payload)
}

fn write_user_payload(
    filer: &Filer,
    ctx: &SkipListMapContext,
    index: u32,
    payload: &[u8],
) -> Result<()> {
    filer.write_at(user_payload_offset(ctx, index), payload)
}
