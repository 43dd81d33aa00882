//! Cursor positions for incremental capture.
//!
//! The absolute position is `history_size + cursor_y`. The visible row
//! alone wraps back when the pane scrolls; adding the scrollback length
//! makes it grow with output, and it only shrinks when the pane is reset.
//!
//! Once the history reaches its limit and the cursor sits on the bottom
//! row, both terms stop moving while output keeps scrolling through. Such a
//! pane is reported as saturated; its position no longer says anything
//! about new output and readers have to compare content instead.

use crate::runtime::{LineRange, PaneCursor};

/// Absolute, monotonically increasing output position.
pub fn position(cursor: PaneCursor) -> u64 {
    cursor.history_size + cursor.cursor_y
}

/// The history is full, so `position` is pinned while output continues.
pub fn saturated(cursor: PaneCursor) -> bool {
    cursor.history_limit > 0 && cursor.history_size >= cursor.history_limit
}

/// How a poll relates to the previously recorded position.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Progress {
    /// Output advanced past the recorded position.
    Advanced,
    Unchanged,
    /// Position went backwards: the pane was cleared or the history shrank.
    Reset,
}

pub fn progress(last: u64, current: u64) -> Progress {
    use std::cmp::Ordering;
    match current.cmp(&last) {
        Ordering::Greater => Progress::Advanced,
        Ordering::Equal => Progress::Unchanged,
        Ordering::Less => Progress::Reset,
    }
}

/// Rows produced after `from` up to and including the cursor row, as a
/// pane-relative range (negative rows reach into scrollback). `None`
/// when there is nothing new or the position went backwards.
pub fn range_since(from: u64, cursor: PaneCursor) -> Option<LineRange> {
    if position(cursor) <= from {
        return None;
    }
    let start = from as i64 + 1 - cursor.history_size as i64;
    Some(LineRange {
        start: Some(start),
        end: Some(cursor.cursor_y as i64),
    })
}

/// The last `lines` rows ending at the cursor row.
pub fn last_lines(lines: u32, cursor: PaneCursor) -> LineRange {
    let end = cursor.cursor_y as i64;
    let start = end - i64::from(lines.max(1)) + 1;
    // cannot reach further back than the top of the history
    let start = start.max(-(cursor.history_size as i64));
    LineRange {
        start: Some(start),
        end: Some(end),
    }
}

/// Visible pane, optionally extended `backfill` lines into scrollback.
pub fn visible_with_backfill(backfill: u32) -> LineRange {
    LineRange {
        start: (backfill > 0).then(|| -i64::from(backfill)),
        end: None,
    }
}
