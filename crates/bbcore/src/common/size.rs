/// Rounds `size` up to the nearest multiple of `granularity`.
///
/// A granularity of zero or one leaves the size untouched.
pub fn round_up(size: u64, granularity: u64) -> u64 {
    if granularity <= 1 || size == 0 {
        return size;
    }
    size.div_ceil(granularity).saturating_mul(granularity)
}

pub fn human_size(size: u64) -> String {
    if size < 2048 {
        format!("{size} B")
    } else if size < 2 * 1024 * 1024 {
        format!("{} KiB", size / 1024)
    } else if size < 2 * 1024 * 1024 * 1024 {
        format!("{} MiB", size / (1024 * 1024))
    } else if size < 2 * 1024 * 1024 * 1024 * 1024 {
        format!("{} GiB", size / (1024 * 1024 * 1024))
    } else {
        format!("{} TiB", size / (1024 * 1024 * 1024 * 1024))
    }
}
