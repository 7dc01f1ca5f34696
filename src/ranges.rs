use crate::error::LedgerError;
use crate::ledger::ConnectionRecord;

/// 将 `[0, total)` 平均切分为 `count` 段，最后一段吸收余数
pub fn split_ranges(
    task_id: u32,
    total: u64,
    count: u32,
) -> Result<Vec<ConnectionRecord>, LedgerError> {
    if count == 0 {
        return Err(LedgerError::Consistency(format!(
            "task {} cannot be split into zero ranges",
            task_id
        )));
    }
    if total < count as u64 {
        return Err(LedgerError::Consistency(format!(
            "task {} of {} bytes cannot be split into {} ranges",
            task_id, total, count
        )));
    }

    let each = total / count as u64;
    let ranges = (0..count)
        .map(|index| {
            let start = index as u64 * each;
            let end = if index + 1 == count {
                total
            } else {
                start + each
            };
            ConnectionRecord::new(task_id, index, start, Some(end))
        })
        .collect();
    Ok(ranges)
}

/// Verifies that `connections` partition `[0, total)`: indexes `0..k` in
/// order, each range starting where the previous one ended, and progress
/// pointers inside their range. An open last range is accepted while the
/// total is unknown, or bounded by the total when it is known.
pub fn check_partition(
    connections: &[ConnectionRecord],
    total: Option<u64>,
) -> Result<(), LedgerError> {
    let Some(first) = connections.first() else {
        return Ok(());
    };
    let fail = |msg: String| Err(LedgerError::Consistency(msg));

    let mut expected_start = 0u64;
    for (position, conn) in connections.iter().enumerate() {
        if conn.task_id != first.task_id {
            return fail(format!(
                "ranges of task {} mixed with task {}",
                first.task_id, conn.task_id
            ));
        }
        if conn.index as usize != position {
            return fail(format!(
                "task {} range at position {} has index {}",
                conn.task_id, position, conn.index
            ));
        }
        if conn.start_offset != expected_start {
            return fail(format!(
                "task {} range {} starts at {}, expected {}",
                conn.task_id, conn.index, conn.start_offset, expected_start
            ));
        }
        conn.check_offsets().map_err(LedgerError::Consistency)?;

        let is_last = position + 1 == connections.len();
        match (conn.end_offset, is_last) {
            (Some(end), _) => expected_start = end,
            (None, true) => {
                if let Some(total) = total {
                    if conn.current_offset > total || conn.start_offset > total {
                        return fail(format!(
                            "task {} open range {} runs past total {}",
                            conn.task_id, conn.index, total
                        ));
                    }
                }
                return Ok(());
            }
            (None, false) => {
                return fail(format!(
                    "task {} range {} is open but not last",
                    conn.task_id, conn.index
                ));
            }
        }
    }

    match total {
        Some(total) if expected_start != total => fail(format!(
            "task {} ranges cover [0, {}) but total is {}",
            first.task_id, expected_start, total
        )),
        _ => Ok(()),
    }
}

/// Bytes already transferred across all ranges.
pub fn downloaded(connections: &[ConnectionRecord]) -> u64 {
    connections.iter().map(ConnectionRecord::downloaded).sum()
}
