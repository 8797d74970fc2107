use protecc::{
    BasenameRule, CompileConfig, CompileMode, ErrorKind, NetFamily, NetProtocol, NetRule,
    Permission, ProfileBuilder, RuleAction, import_net_blob, import_path_blob,
};

const MODES: [CompileMode; 2] = [CompileMode::Trie, CompileMode::Dfa];

fn config(mode: CompileMode) -> CompileConfig {
    CompileConfig {
        mode,
        ..CompileConfig::default()
    }
}

fn compile(patterns: &[(&str, Permission)], mode: CompileMode) -> protecc::CompiledProfile {
    let _ = env_logger::builder().is_test(true).try_init();
    let mut builder = ProfileBuilder::new();
    for (pattern, perms) in patterns {
        builder.add_pattern(pattern, *perms).expect("valid pattern");
    }
    builder.compile(&config(mode)).expect("compile")
}

#[test]
fn usr_bin_star_matches_one_level() {
    for mode in MODES {
        let profile = compile(&[("/usr/bin/*", Permission::READ | Permission::EXEC)], mode);
        assert_eq!(
            profile.lookup("/usr/bin/ls"),
            Permission::READ | Permission::EXEC,
            "{mode:?}"
        );
        assert_eq!(profile.lookup("/usr/bin/sub/ls"), Permission::NONE, "{mode:?}");
    }
}

#[test]
fn var_log_recursive_matches_tree_and_directory() {
    for mode in MODES {
        let profile = compile(&[("/var/log/**", Permission::READ)], mode);
        assert_eq!(profile.lookup("/var/log/a/b/c.txt"), Permission::READ, "{mode:?}");
        assert_eq!(profile.lookup("/var/log"), Permission::READ, "{mode:?}");
    }
}

#[test]
fn deepest_pattern_wins_with_or_on_ties() {
    for mode in MODES {
        let profile = compile(
            &[
                ("/etc/*.conf", Permission::READ),
                ("/etc/app.conf", Permission::READ | Permission::WRITE),
            ],
            mode,
        );
        assert_eq!(
            profile.lookup("/etc/app.conf"),
            Permission::READ | Permission::WRITE,
            "{mode:?}"
        );
    }
}

#[test]
fn numbered_log_basename_rule() {
    let rule = BasenameRule::parse("log-[0-9]+.txt").expect("basename rule");
    assert!(rule.matches("log-42.txt"));
    assert!(rule.matches("log-1.txt"));
    assert!(!rule.matches("log-.txt"));
    assert!(!rule.matches("log-1a.txt"));
}

#[test]
fn path_blob_round_trip() {
    for mode in MODES {
        let profile = compile(&[("/a", Permission::READ)], mode);
        let blob = profile.export_path_blob().expect("export");
        let imported = import_path_blob(&blob).expect("import");
        assert_eq!(imported.lookup(b"/a"), Permission::READ, "{mode:?}");
        assert_eq!(imported.lookup(b"/b"), Permission::NONE, "{mode:?}");
    }
}

#[test]
fn unix_rule_family_validation() {
    let rule = NetRule::new(RuleAction::Allow, NetProtocol::Unix, NetFamily::Any)
        .with_ports(0, 0)
        .with_unix_path("/var/run/app.sock");
    let mut builder = ProfileBuilder::new();
    builder.add_net_rule(&rule).expect("unix rule accepted");
    let profile = builder.compile(&CompileConfig::default()).expect("compile");
    let mut blob = profile.export_net_blob().expect("export");
    assert_eq!(import_net_blob(&blob).expect("import"), vec![rule.clone()]);

    let mut ipv4 = rule.clone();
    ipv4.family = NetFamily::Ipv4;
    let err = ProfileBuilder::new().add_net_rule(&ipv4).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidArgument);

    // family byte of the only record, after the 20-byte header
    blob[22] = NetFamily::Ipv4 as u8;
    assert_eq!(import_net_blob(&blob).unwrap_err().kind(), ErrorKind::InvalidBlob);
}

#[test]
fn case_insensitive_flag_survives_export() {
    for mode in MODES {
        let mut builder = ProfileBuilder::new();
        builder.add_pattern("/Data/*.TXT", Permission::READ).unwrap();
        let config = CompileConfig {
            mode,
            case_insensitive: true,
            ..CompileConfig::default()
        };
        let profile = builder.compile(&config).unwrap();
        assert_eq!(profile.lookup("/data/notes.txt"), Permission::READ);
        let imported = import_path_blob(&profile.export_path_blob().unwrap()).unwrap();
        assert_eq!(imported.lookup(b"/DATA/X.txt"), Permission::READ, "{mode:?}");
    }
}
