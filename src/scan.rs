//! # Scan
//!
//! Finds hackable regions by walking code byte-by-byte looking for tag signatures.
//!
//! The matcher is deliberately naive: on a mismatch it backs up to one byte past where the
//! candidate tag began and tries again, so overlapping false starts are never skipped.
//! Only one start may be pending at a time. A second start tag before an end tag replaces
//! the first, which means regions cannot nest.

use log::{debug, trace, warn};

use crate::error::Error;
use crate::tag::{TagKind, TAG_SIZE};
use crate::view::CodeView;

/// Furthest distance (in bytes) from the scan origin a tag may start before the scan gives up
pub const FAIL_SAFE_LIMIT: usize = 4096;

/// Half-open address range `[start, end)` of one hackable region
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BoundaryMarker {
    /// First byte after the start tag
    pub start: usize,
    /// First byte of the end tag
    pub end: usize,
}

impl BoundaryMarker {
    /// Number of bytes between the tags, zero if `end` comes before `start`
    pub fn len(&self) -> usize {
        self.end.saturating_sub(self.start)
    }

    /// Whether the tags are back to back
    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }
}

/// Result of a scan
#[derive(Debug)]
pub struct Scan {
    /// Markers found, in the order they appear in memory
    pub markers: Vec<BoundaryMarker>,
    /// Set when the scan stopped without seeing a stop tag.
    /// `markers` is still usable in that case.
    pub error: Option<Error>,
}

impl Scan {
    /// Whether the scan ended on a stop tag
    pub fn is_complete(&self) -> bool {
        self.error.is_none()
    }
}

/// Tag scanner with a configurable fail-safe distance
#[derive(Debug, Clone, Copy)]
pub struct Scanner {
    /// See [`FAIL_SAFE_LIMIT`]
    limit: usize,
}

impl Default for Scanner {
    fn default() -> Self {
        Self {
            limit: FAIL_SAFE_LIMIT,
        }
    }
}

impl Scanner {
    /// Creates a scanner using [`FAIL_SAFE_LIMIT`]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a scanner that gives up `limit` bytes past its origin
    pub fn with_limit(limit: usize) -> Self {
        Self { limit }
    }

    /// Fail-safe distance of this scanner
    pub fn limit(&self) -> usize {
        self.limit
    }

    /// Number of bytes a scan may need to read, including a tag starting right at the limit
    pub fn horizon(&self) -> usize {
        self.limit + TAG_SIZE
    }

    /// Scans `view` from its first byte
    pub fn scan(&self, view: CodeView<'_>) -> Scan {
        let mut markers = Vec::new();
        // where the current tag attempt began
        let mut base = 0usize;
        // next byte to examine
        let mut seek = 0usize;
        let mut target: Option<TagKind> = None;
        let mut pending: Option<usize> = None;

        trace!(
            "Scanning for hackable code at {:#x} ({} bytes)",
            view.address(),
            view.len()
        );

        loop {
            if base > self.limit {
                return self.trip(view, markers);
            }
            let byte = match view.get(seek) {
                Some(byte) => byte,
                None => return self.trip(view, markers),
            };

            let kind = match target {
                Some(kind) => kind,
                None => {
                    match TagKind::from_first_byte(byte) {
                        Some(kind) => {
                            target = Some(kind);
                            seek += 1;
                        }
                        None => {
                            base += 1;
                            seek = base;
                        }
                    }
                    continue;
                }
            };

            if byte != kind.signature()[seek - base] {
                // false start, retry one byte further along
                target = None;
                base += 1;
                seek = base;
                continue;
            }

            seek += 1;
            if seek - base < TAG_SIZE {
                continue;
            }

            match kind {
                TagKind::Start => {
                    if let Some(previous) = pending.replace(view.address_of(seek)) {
                        debug!("Discarding unclosed hackable code start at {previous:#x}");
                    }
                }
                TagKind::End => match pending.take() {
                    Some(start) => markers.push(BoundaryMarker {
                        start,
                        end: view.address_of(base),
                    }),
                    None => trace!("Ignoring end tag at {:#x}", view.address_of(base)),
                },
                TagKind::StopSearch => {
                    if let Some(start) = pending {
                        debug!("Discarding unclosed hackable code start at {start:#x}");
                    }
                    debug!(
                        "Found {} hackable region(s) at {:#x}",
                        markers.len(),
                        view.address()
                    );
                    return Scan {
                        markers,
                        error: None,
                    };
                }
            }

            target = None;
            base = seek;
        }
    }

    /// Ends a scan that ran past the fail-safe limit or the end of the view
    fn trip(&self, view: CodeView<'_>, markers: Vec<BoundaryMarker>) -> Scan {
        let error = Error::ScanFailSafeTripped {
            origin: view.address(),
            limit: self.limit,
        };
        warn!("Potentially fatal error: {error}");
        Scan {
            markers,
            error: Some(error),
        }
    }
}

/// Scans `view` with the default [`Scanner`]
pub fn scan(view: CodeView<'_>) -> Scan {
    Scanner::default().scan(view)
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;
    use crate::error::Error;
    use crate::tag::{END_TAG, START_TAG, STOP_SEARCH_TAG};

    /// Concatenates byte chunks
    fn bytes(parts: &[&[u8]]) -> Vec<u8> {
        parts.concat()
    }

    /// Offset-based view of the markers for readable assertions
    fn offsets(data: &[u8], scan: &Scan) -> Vec<(usize, usize)> {
        let base = data.as_ptr() as usize;
        scan.markers
            .iter()
            .map(|m| (m.start - base, m.end - base))
            .collect()
    }

    #[test]
    fn test_marker_len() {
        let marker = BoundaryMarker { start: 0x10, end: 0x18 };
        assert_eq!(marker.len(), 8);
        assert!(!marker.is_empty());

        let inverted = BoundaryMarker { start: 0x18, end: 0x10 };
        assert_eq!(inverted.len(), 0);
    }

    #[test]
    fn test_single_region() {
        let data = bytes(&[
            &[0x90, 0x90],
            &START_TAG,
            &[0x31, 0xc0, 0xc3],
            &END_TAG,
            &STOP_SEARCH_TAG,
        ]);

        let scan = scan(CodeView::from_slice(&data));

        assert!(scan.is_complete());
        assert_eq!(offsets(&data, &scan), [(12, 15)]);
        assert_eq!(scan.markers[0].len(), 3);
    }

    #[test]
    /// Regions come back in the order they appear
    fn test_multiple_regions() {
        let data = bytes(&[
            &START_TAG,
            &[0x01],
            &END_TAG,
            &[0xcc, 0xcc],
            &START_TAG,
            &[0x02, 0x03],
            &END_TAG,
            &START_TAG,
            &END_TAG,
            &STOP_SEARCH_TAG,
        ]);

        let scan = scan(CodeView::from_slice(&data));

        assert!(scan.is_complete());
        assert_eq!(offsets(&data, &scan), [(10, 11), (33, 35), (55, 55)]);
        assert!(scan.markers[2].is_empty());
    }

    #[test]
    fn test_unclosed_start() {
        let data = bytes(&[&START_TAG, &[0x90, 0x90], &STOP_SEARCH_TAG]);

        let scan = scan(CodeView::from_slice(&data));

        assert!(scan.is_complete());
        assert!(scan.markers.is_empty());
    }

    #[test]
    fn test_end_without_start() {
        let data = bytes(&[
            &END_TAG,
            &START_TAG,
            &[0x90],
            &END_TAG,
            &STOP_SEARCH_TAG,
        ]);

        let scan = scan(CodeView::from_slice(&data));

        assert_eq!(offsets(&data, &scan), [(20, 21)]);
    }

    #[test]
    /// A second start replaces the first, so regions never nest
    fn test_restart_overwrites_pending() {
        let data = bytes(&[
            &START_TAG,
            &[0x90],
            &START_TAG,
            &[0x91],
            &END_TAG,
            &STOP_SEARCH_TAG,
        ]);

        let scan = scan(CodeView::from_slice(&data));

        assert_eq!(offsets(&data, &scan), [(21, 22)]);
    }

    #[test]
    /// Nothing after the stop tag is considered
    fn test_stop_ends_scan() {
        let data = bytes(&[&STOP_SEARCH_TAG, &START_TAG, &[0x90], &END_TAG]);

        let scan = scan(CodeView::from_slice(&data));

        assert!(scan.is_complete());
        assert!(scan.markers.is_empty());
    }

    #[rstest]
    #[case::start_byte(&[0x57])]
    #[case::partial_start(&[0x57, 0x6a, 0x45, 0xbf])]
    #[case::end_byte(&[0x56])]
    #[case::partial_end(&[0x56, 0x6a, 0x45, 0xbe, 0xde])]
    #[case::partial_end_twice(&[0x56, 0x6a, 0x56, 0x6a, 0x45])]
    #[case::partial_stop(&[0x52, 0x6a, 0x45, 0xba, 0x5e, 0xea])]
    /// False starts right before the end tag belong to the region, and the end tag itself never does
    fn test_false_start_before_end(#[case] noise: &[u8]) {
        let data = bytes(&[&START_TAG, &[0x90], noise, &END_TAG, &STOP_SEARCH_TAG]);

        let scan = scan(CodeView::from_slice(&data));

        assert!(scan.is_complete());
        assert_eq!(offsets(&data, &scan), [(10, 11 + noise.len())]);
    }

    #[rstest]
    #[case::partial_start(&[0x57, 0x6a, 0x45])]
    #[case::partial_stop(&[0x52, 0x6a])]
    #[case::nearly_full_start(&[0x57, 0x6a, 0x45, 0xbf, 0xde, 0xc0, 0xed, 0xfe, 0x5f])]
    fn test_false_start_before_start(#[case] noise: &[u8]) {
        let data = bytes(&[noise, &START_TAG, &[0x90, 0x90], &END_TAG, &STOP_SEARCH_TAG]);

        let scan = scan(CodeView::from_slice(&data));

        let start = noise.len() + START_TAG.len();
        assert_eq!(offsets(&data, &scan), [(start, start + 2)]);
    }

    #[test]
    /// Running past the limit keeps what was already found
    fn test_fail_safe_limit() {
        let mut data = bytes(&[&START_TAG, &[0x90], &END_TAG, &START_TAG]);
        data.resize(200, 0xcc);
        data.extend_from_slice(&END_TAG);
        data.extend_from_slice(&STOP_SEARCH_TAG);

        let scan = Scanner::with_limit(100).scan(CodeView::from_slice(&data));

        assert!(!scan.is_complete());
        assert!(matches!(
            scan.error,
            Some(Error::ScanFailSafeTripped { limit: 100, .. })
        ));
        assert_eq!(offsets(&data, &scan), [(10, 11)]);
    }

    #[test]
    /// A tag starting exactly at the limit is still matched
    fn test_tag_at_limit() {
        let mut data = vec![0xcc; 100];
        data.extend_from_slice(&STOP_SEARCH_TAG);

        let scanner = Scanner::with_limit(100);
        assert_eq!(scanner.horizon(), data.len());

        let scan = scanner.scan(CodeView::from_slice(&data));
        assert!(scan.is_complete());
    }

    #[test]
    fn test_end_of_view() {
        let data = bytes(&[&START_TAG, &[0x90], &END_TAG, &STOP_SEARCH_TAG[..4]]);

        let scan = scan(CodeView::from_slice(&data));

        assert!(!scan.is_complete());
        assert_eq!(offsets(&data, &scan), [(10, 11)]);
    }
}
