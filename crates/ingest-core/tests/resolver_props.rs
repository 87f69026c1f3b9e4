//! Property tests for change-set resolution

use ingest_asset::{ImageFilter, WatchedPrefix, DEFAULT_IMAGE_EXTENSIONS};
use ingest_core::ChangeSetResolver;
use proptest::prelude::*;

fn resolver() -> ChangeSetResolver {
    let prefix = WatchedPrefix::new("images").unwrap();
    ChangeSetResolver::from_event_paths(ImageFilter::new(prefix, DEFAULT_IMAGE_EXTENSIONS.iter().copied()))
}

fn path() -> impl Strategy<Value = String> {
    let dir = prop_oneof![
        Just("images/"),
        Just("images/sub/"),
        Just("imagesx/"),
        Just("docs/"),
        Just(""),
        Just("./images/"),
    ];
    let ext = prop_oneof![
        Just("png"),
        Just("PNG"),
        Just("jpg"),
        Just("jpeg"),
        Just("gif"),
        Just("md"),
        Just(""),
    ];
    (dir, "[a-z]{1,6}", ext).prop_map(|(d, stem, e)| {
        if e.is_empty() {
            format!("{d}{stem}")
        } else {
            format!("{d}{stem}.{e}")
        }
    })
}

proptest! {
    #[test]
    fn output_is_sorted_unique_and_filtered(paths in prop::collection::vec(path(), 0..40)) {
        let r = resolver();
        let keys = r.select(&paths);

        prop_assert!(keys.windows(2).all(|w| w[0] < w[1]));
        prop_assert!(keys.len() <= paths.len());
        for k in &keys {
            prop_assert!(k.as_str().starts_with("images/"));
            prop_assert!(r.filter().matches(k));
        }
    }

    #[test]
    fn selection_ignores_input_order_and_duplicates(paths in prop::collection::vec(path(), 0..20)) {
        let r = resolver();
        let mut doubled: Vec<String> = paths.iter().rev().cloned().collect();
        doubled.extend(paths.iter().cloned());

        prop_assert_eq!(r.select(&paths), r.select(&doubled));
    }
}
