use std::{io, path::Path};

use tokio::io::{AsyncReadExt, AsyncSeekExt};

pub const DEFAULT_LINES: usize = 100;
pub const MAX_LINES: usize = 5000;
const MAX_TAIL_BYTES: u64 = 4 * 1024 * 1024;

pub fn clamp_lines(n: usize) -> usize {
    if n == 0 {
        return DEFAULT_LINES;
    }
    n.min(MAX_LINES)
}

fn split_lines_from_tail(buf: &[u8], max_lines: usize, partial_head: bool) -> Vec<String> {
    // Best-effort UTF-8: invalid sequences are replaced.
    let text = String::from_utf8_lossy(buf);
    let mut out: Vec<String> = text.lines().map(|l| l.to_string()).collect();

    // The read began mid-line; the first fragment is not a whole line.
    if partial_head && !out.is_empty() {
        out.remove(0);
    }

    if out.len() > max_lines {
        out.drain(0..(out.len() - max_lines));
    }
    out
}

/// Returns the last `lines` lines of `path`, or an empty string if the file
/// does not exist yet.
pub async fn tail_file(path: &Path, lines: usize) -> io::Result<String> {
    let meta = match tokio::fs::metadata(path).await {
        Ok(m) => m,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(String::new()),
        Err(e) => return Err(e),
    };
    if !meta.is_file() {
        return Ok(String::new());
    }

    let size = meta.len();
    let start = size.saturating_sub(MAX_TAIL_BYTES);

    let mut f = tokio::fs::File::open(path).await?;
    f.seek(io::SeekFrom::Start(start)).await?;
    let mut buf = Vec::with_capacity((size - start) as usize);
    f.read_to_end(&mut buf).await?;

    let tail = split_lines_from_tail(&buf, clamp_lines(lines), start > 0);
    if tail.is_empty() {
        return Ok(String::new());
    }
    let mut text = tail.join("\n");
    text.push('\n');
    Ok(text)
}
