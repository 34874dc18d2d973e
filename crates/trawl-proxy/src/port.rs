//! Listening port allocation.

use std::net::{Ipv4Addr, TcpListener};
use std::ops::RangeInclusive;

/// Returns true if a TCP listener can bind `port` on loopback right now.
///
/// The probe listener is closed immediately, so the answer is only a hint.
pub fn is_bindable(port: u16) -> bool {
    TcpListener::bind((Ipv4Addr::LOCALHOST, port)).is_ok()
}

/// Returns the lowest bindable port in `range`.
pub fn find_free(range: RangeInclusive<u16>) -> Option<u16> {
    range.into_iter().find(|port| is_bindable(*port))
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Finds three consecutive ports that are currently free.
    fn free_triple() -> u16 {
        (40_000u16..60_000)
            .step_by(7)
            .find(|p| (0..3).all(|i| is_bindable(p + i)))
            .unwrap()
    }

    fn hold(port: u16) -> TcpListener {
        TcpListener::bind((Ipv4Addr::LOCALHOST, port)).unwrap()
    }

    #[test]
    fn test_occupied_port_is_not_bindable() {
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
        let port = listener.local_addr().unwrap().port();
        assert!(!is_bindable(port));

        drop(listener);
        assert!(is_bindable(port));
    }

    #[test]
    fn test_find_free_skips_occupied() {
        let base = free_triple();
        let _a = hold(base);
        let _b = hold(base + 1);

        assert_eq!(find_free(base..=base + 2), Some(base + 2));
    }

    #[test]
    fn test_find_free_exhausted() {
        let base = free_triple();
        let _a = hold(base);
        let _b = hold(base + 1);
        let _c = hold(base + 2);

        assert_eq!(find_free(base..=base + 2), None);
    }

    #[test]
    fn test_find_free_prefers_lowest() {
        let base = free_triple();
        assert_eq!(find_free(base..=base + 2), Some(base));
    }
}
