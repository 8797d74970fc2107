#![no_main]

use libfuzzer_sys::fuzz_target;
use protecc::PathBlobView;

fuzz_target!(|data: &[u8]| {
    let (blob, path) = data.split_at(data.len() / 2);
    if let Ok(view) = PathBlobView::new(blob) {
        let _ = view.lookup(path);
    }
    let _ = protecc::import_path_blob(blob);
});
