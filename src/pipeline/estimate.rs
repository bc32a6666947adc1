//! Engine pre-selection heuristic

use crate::input::ImageMime;
use crate::vision::EngineKind;

const MIB: u64 = 1024 * 1024;

/// Files above this size usually hold dense or photographed pages
const LARGE_FILE_BYTES: u64 = 5 * MIB;

/// JPEGs above this size are usually photos rather than scans
const LARGE_JPEG_BYTES: u64 = 2 * MIB;

/// Guess which engine suits a file without looking at its pixels.
///
/// Pure: no I/O, no decoding. Not binding on the orchestrator. Unknown MIME
/// types are judged on size alone.
pub fn estimate_best_method(size_bytes: u64, mime_type: &str) -> EngineKind {
    if size_bytes > LARGE_FILE_BYTES {
        return EngineKind::Accurate;
    }

    match mime_type.parse::<ImageMime>() {
        Ok(ImageMime::Jpeg) if size_bytes > LARGE_JPEG_BYTES => EngineKind::Accurate,
        _ => EngineKind::Fast,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_small_files_prefer_fast() {
        assert_eq!(estimate_best_method(100_000, "image/png"), EngineKind::Fast);
        assert_eq!(estimate_best_method(MIB, "image/jpeg"), EngineKind::Fast);
    }

    #[test]
    fn test_large_files_prefer_accurate() {
        assert_eq!(estimate_best_method(6 * MIB, "image/png"), EngineKind::Accurate);
        assert_eq!(estimate_best_method(6 * MIB, "text/plain"), EngineKind::Accurate);
    }

    #[test]
    fn test_large_jpeg_prefers_accurate() {
        assert_eq!(estimate_best_method(3 * MIB, "image/jpeg"), EngineKind::Accurate);
        assert_eq!(estimate_best_method(3 * MIB, "IMAGE/JPG"), EngineKind::Accurate);
        assert_eq!(estimate_best_method(3 * MIB, "image/webp"), EngineKind::Fast);
    }
}
