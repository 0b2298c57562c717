#![no_main]

use libfuzzer_sys::fuzz_target;
use sqlconn::dsn::build_dsn;
use sqlconn::tunnel::InstanceName;
use sqlconn::{DatabaseConfig, Driver};

fuzz_target!(|data: &[u8]| {
    let Ok(text) = std::str::from_utf8(data) else {
        return;
    };

    let _ = text.parse::<Driver>();

    if let Ok(name) = text.parse::<InstanceName>() {
        assert!(!name.project().is_empty());
        assert!(!name.region().is_empty());
        assert!(!name.name().is_empty());
    }

    // Split the input into config fields and make sure DSN building never panics.
    let mut parts = text.splitn(4, '\n');
    let cfg = DatabaseConfig::new(
        parts.next().unwrap_or_default(),
        parts.next().unwrap_or_default(),
    )
    .host(parts.next().unwrap_or_default(), 5432)
    .credentials("fuzz", parts.next().unwrap_or_default());
    let _ = build_dsn(&cfg);
});
