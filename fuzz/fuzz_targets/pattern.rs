#![no_main]

use libfuzzer_sys::fuzz_target;
use protecc::{CompileConfig, Permission, ProfileBuilder};

fuzz_target!(|data: &[u8]| {
    let Ok(text) = std::str::from_utf8(data) else {
        return;
    };
    let _ = protecc::pattern::parse(text);
    let mut builder = ProfileBuilder::new();
    if builder.add_pattern(text, Permission::READ).is_ok()
        && let Ok(profile) = builder.compile(&CompileConfig::default())
    {
        let _ = profile.lookup(text);
    }
});
