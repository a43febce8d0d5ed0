use sqlx::types::chrono;

/// Seconds since the unix epoch, the time base for every deadline in the
/// schema.
pub(crate) fn now_unix() -> i64 {
    chrono::Utc::now().timestamp()
}

pub(crate) fn fmt_remaining(seconds: i64) -> String {
    if seconds < 60 {
        return format!("{}s", seconds.max(0));
    }
    if seconds < 60 * 60 {
        return format!("{}m", seconds / 60);
    }
    format!("{}h{}m", seconds / (60 * 60), (seconds % (60 * 60)) / 60)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn formats_remaining_time() {
        assert_eq!(fmt_remaining(-5), "0s");
        assert_eq!(fmt_remaining(42), "42s");
        assert_eq!(fmt_remaining(150), "2m");
        assert_eq!(fmt_remaining(3 * 60 * 60 + 12 * 60), "3h12m");
    }
}
