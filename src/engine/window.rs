use crate::engine::store::{Message, message_bytes};
use crate::error::WindowError;
use anyhow::{Result, anyhow};
use sha2::{Digest, Sha256};
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepUnit {
    Messages,
    Hours,
    Days,
    Bytes,
}

impl FromStr for StepUnit {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "messages" => Ok(Self::Messages),
            "hours" => Ok(Self::Hours),
            "days" => Ok(Self::Days),
            "bytes" => Ok(Self::Bytes),
            other => Err(anyhow!(
                "unknown step unit `{other}`: use messages, hours, days, or bytes"
            )),
        }
    }
}

#[derive(Debug, Clone)]
pub struct WindowPolicy {
    pub step_size: u64,
    pub step_unit: StepUnit,
    pub overlap_ratio: f64,
    pub max_bytes_per_window: u64,
    pub max_split_depth: u32,
}

/// A contiguous slice of the sealed message stream. Windows carry message
/// ids, not message bodies; the runner re-projects bodies when it builds
/// the generation request.
#[derive(Debug, Clone)]
pub struct Window {
    pub window_id: String,
    pub start_epoch_secs: i64,
    pub end_epoch_secs: i64,
    pub message_ids: Vec<String>,
    pub parent_window_id: Option<String>,
    pub split_depth: u32,
}

impl Window {
    /// Content-addressed identity: same ids under the same producer version
    /// means the committed artifact is reusable on resume.
    pub fn fingerprint(&self, producer_version: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(producer_version.as_bytes());
        for id in &self.message_ids {
            hasher.update(b"\n");
            hasher.update(id.as_bytes());
        }
        format!("{:x}", hasher.finalize())
    }
}

fn window_from_slice(window_id: String, slice: &[Message]) -> Window {
    Window {
        window_id,
        start_epoch_secs: slice.first().map(|m| m.timestamp).unwrap_or(0),
        end_epoch_secs: slice.last().map(|m| m.timestamp).unwrap_or(0),
        message_ids: slice.iter().map(|m| m.id.clone()).collect(),
        parent_window_id: None,
        split_depth: 0,
    }
}

/// Partition `messages` (already sorted by the store) into step boundaries.
/// Boundaries depend on the step unit:
///   messages — fixed-count chunks, last chunk may be short
///   hours/days — aligned wall-clock buckets, empty buckets skipped
///   bytes — greedy fill up to step_size, single oversized message gets
///           its own window
fn step_boundaries(messages: &[Message], policy: &WindowPolicy) -> Vec<(usize, usize)> {
    let mut bounds = Vec::new();
    match policy.step_unit {
        StepUnit::Messages => {
            let step = policy.step_size as usize;
            let mut start = 0;
            while start < messages.len() {
                let end = (start + step).min(messages.len());
                bounds.push((start, end));
                start = end;
            }
        }
        StepUnit::Hours | StepUnit::Days => {
            let unit_secs: i64 = match policy.step_unit {
                StepUnit::Hours => 3_600,
                _ => 86_400,
            };
            let span = unit_secs.saturating_mul(policy.step_size as i64).max(1);
            let mut start = 0;
            while start < messages.len() {
                let bucket = messages[start].timestamp.div_euclid(span);
                let mut end = start + 1;
                while end < messages.len() && messages[end].timestamp.div_euclid(span) == bucket {
                    end += 1;
                }
                bounds.push((start, end));
                start = end;
            }
        }
        StepUnit::Bytes => {
            let cap = policy.step_size.max(1);
            let mut start = 0;
            while start < messages.len() {
                let mut end = start;
                let mut used = 0u64;
                while end < messages.len() {
                    let size = message_bytes(&messages[end]);
                    if end > start && used + size > cap {
                        break;
                    }
                    used += size;
                    end += 1;
                    if used >= cap {
                        break;
                    }
                }
                bounds.push((start, end));
                start = end;
            }
        }
    }
    bounds
}

/// Build the ordered window plan. Each window after the first is extended
/// backwards by `overlap_ratio` of the step so the generator keeps
/// conversational context across boundaries. Overlapped messages belong to
/// both windows for prompting but only the earlier window publishes them.
pub fn make_windows(messages: &[Message], policy: &WindowPolicy) -> Vec<Window> {
    if messages.is_empty() {
        return Vec::new();
    }

    let bounds = step_boundaries(messages, policy);
    let mut windows = Vec::with_capacity(bounds.len());
    for (idx, (start, end)) in bounds.iter().copied().enumerate() {
        let overlap = if idx == 0 {
            0
        } else {
            let step_len = end - start;
            ((step_len as f64) * policy.overlap_ratio).floor() as usize
        };
        let overlapped_start = start.saturating_sub(overlap);
        let slice = &messages[overlapped_start..end];
        windows.push(window_from_slice(format!("w{idx:04}"), slice));
    }
    windows
}

/// Bisect an oversized window by message count. Returns the two halves, or
/// an error when the window is already a single message or the split-depth
/// ceiling is reached; at that point no further reduction can help.
pub fn split_window(window: &Window, max_split_depth: u32) -> Result<(Window, Window), WindowError> {
    if window.split_depth >= max_split_depth {
        return Err(WindowError::TooLarge {
            window_id: window.window_id.clone(),
            reason: format!("split depth {} reached the ceiling", window.split_depth),
        });
    }
    if window.message_ids.len() < 2 {
        return Err(WindowError::TooLarge {
            window_id: window.window_id.clone(),
            reason: "single message exceeds the generation budget".to_string(),
        });
    }

    let mid = window.message_ids.len() / 2;
    let child = |suffix: u8, ids: &[String]| Window {
        window_id: format!("{}.{suffix}", window.window_id),
        // Child time bounds are refined by the runner from the messages it
        // projects; the plan only needs the id partition here.
        start_epoch_secs: window.start_epoch_secs,
        end_epoch_secs: window.end_epoch_secs,
        message_ids: ids.to_vec(),
        parent_window_id: Some(window.window_id.clone()),
        split_depth: window.split_depth + 1,
    };

    Ok((
        child(1, &window.message_ids[..mid]),
        child(2, &window.message_ids[mid..]),
    ))
}

#[cfg(test)]
mod tests {
    use super::{StepUnit, Window, WindowPolicy, make_windows, split_window};
    use crate::engine::store::Message;
    use std::str::FromStr;

    fn msg(idx: usize, timestamp: i64) -> Message {
        Message {
            id: format!("m{idx:04}"),
            thread_id: "t1".to_string(),
            timestamp,
            author: "p-0011223344556677".to_string(),
            text: "x".repeat(20),
            attachment_refs: Vec::new(),
        }
    }

    fn policy(step_size: u64, unit: StepUnit, overlap: f64) -> WindowPolicy {
        WindowPolicy {
            step_size,
            step_unit: unit,
            overlap_ratio: overlap,
            max_bytes_per_window: 320_000,
            max_split_depth: 5,
        }
    }

    #[test]
    fn count_windows_without_overlap() {
        let messages: Vec<Message> = (0..250).map(|i| msg(i, i as i64)).collect();
        let windows = make_windows(&messages, &policy(100, StepUnit::Messages, 0.0));

        let sizes: Vec<usize> = windows.iter().map(|w| w.message_ids.len()).collect();
        assert_eq!(sizes, [100, 100, 50]);
        assert_eq!(windows[0].window_id, "w0000");
        assert_eq!(windows[2].window_id, "w0002");
    }

    #[test]
    fn overlap_extends_later_windows_backwards() {
        let messages: Vec<Message> = (0..200).map(|i| msg(i, i as i64)).collect();
        let windows = make_windows(&messages, &policy(100, StepUnit::Messages, 0.2));

        assert_eq!(windows[0].message_ids.len(), 100);
        assert_eq!(windows[1].message_ids.len(), 120);
        assert_eq!(windows[1].message_ids[0], "m0080");
        assert_eq!(windows[1].message_ids.last().unwrap(), "m0199");
    }

    #[test]
    fn hour_windows_bucket_by_wall_clock() {
        let mut messages = Vec::new();
        for i in 0..4 {
            messages.push(msg(i, 100 + i as i64));
        }
        for i in 4..7 {
            messages.push(msg(i, 7_300 + i as i64));
        }
        let windows = make_windows(&messages, &policy(1, StepUnit::Hours, 0.0));
        let sizes: Vec<usize> = windows.iter().map(|w| w.message_ids.len()).collect();
        assert_eq!(sizes, [4, 3]);
    }

    #[test]
    fn byte_windows_fill_greedily() {
        // Each message is exactly 40 bytes (author 18 + text 20 + 2).
        let messages: Vec<Message> = (0..6).map(|i| msg(i, i as i64)).collect();
        let windows = make_windows(&messages, &policy(120, StepUnit::Bytes, 0.0));
        let sizes: Vec<usize> = windows.iter().map(|w| w.message_ids.len()).collect();
        assert_eq!(sizes, [3, 3]);
    }

    #[test]
    fn split_partitions_ids_without_loss() {
        let messages: Vec<Message> = (0..7).map(|i| msg(i, i as i64)).collect();
        let parent = &make_windows(&messages, &policy(100, StepUnit::Messages, 0.0))[0];

        let (left, right) = split_window(parent, 5).expect("split");
        assert_eq!(left.window_id, "w0000.1");
        assert_eq!(right.window_id, "w0000.2");
        assert_eq!(left.message_ids.len(), 3);
        assert_eq!(right.message_ids.len(), 4);
        assert_eq!(left.split_depth, 1);
        assert_eq!(left.parent_window_id.as_deref(), Some("w0000"));

        let mut rejoined = left.message_ids.clone();
        rejoined.extend(right.message_ids.clone());
        assert_eq!(rejoined, parent.message_ids);
    }

    #[test]
    fn split_refuses_single_message_window() {
        let window = Window {
            window_id: "w0000".to_string(),
            start_epoch_secs: 0,
            end_epoch_secs: 0,
            message_ids: vec!["m0001".to_string()],
            parent_window_id: None,
            split_depth: 0,
        };
        assert!(split_window(&window, 5).is_err());
    }

    #[test]
    fn split_refuses_past_depth_ceiling() {
        let window = Window {
            window_id: "w0000.1.1".to_string(),
            start_epoch_secs: 0,
            end_epoch_secs: 0,
            message_ids: vec!["m0001".to_string(), "m0002".to_string()],
            parent_window_id: Some("w0000.1".to_string()),
            split_depth: 2,
        };
        assert!(split_window(&window, 2).is_err());
    }

    #[test]
    fn fingerprint_tracks_ids_and_producer_version() {
        let messages: Vec<Message> = (0..3).map(|i| msg(i, i as i64)).collect();
        let window = &make_windows(&messages, &policy(100, StepUnit::Messages, 0.0))[0];

        assert_eq!(window.fingerprint("1.0"), window.fingerprint("1.0"));
        assert_ne!(window.fingerprint("1.0"), window.fingerprint("2.0"));
    }

    #[test]
    fn step_unit_parses_known_names() {
        assert_eq!(StepUnit::from_str("messages").unwrap(), StepUnit::Messages);
        assert_eq!(StepUnit::from_str("Days").unwrap(), StepUnit::Days);
        assert!(StepUnit::from_str("weeks").is_err());
    }
}
