#![no_main]

use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let _ = protecc::import_net_blob(data);
    let _ = protecc::import_mount_blob(data);
});
