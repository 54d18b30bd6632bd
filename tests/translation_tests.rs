//! End-to-end tests of the translation pipeline.

use bumpalo::Bump;
use gpuopt::{
    optimize, parse_kernel, AllocError, Architecture, ConfigError, Kernel, Location, OptimizationLevel, Pass,
    PassMask, Phase, TranslateError, TranslationOptions, TranslationSession, Translator,
};

fn init() {
    let _ = env_logger::builder().is_test(true).try_init();
}

const SHARED_REDUCE: &str = ".kernel reduce .arch ptx
    mov.s32 %r0, %tid.x;
    ld.global.s32 %r1, [%r0];
    st.shared.s32 [buf], %r1;
    bar.sync 0;
    bar.sync 0;
    setp.eq.s32 %r2, %r0, 0;
    @!%r2 bra DONE;
    ld.shared.s32 %r3, [buf+4];
    add.s32 %r1, %r1, %r3;
    st.global.s32 [out], %r1;
DONE:
    ret;";

fn kernel() -> Kernel {
    parse_kernel(SHARED_REDUCE).unwrap()
}

#[test]
fn test_three_values_two_registers() {
    init();
    // r0 and r1 overlap, r2 only starts after r0 is dead.
    let kernel = parse_kernel(
        ".kernel k
            mov.s32 %r0, 1;
            mov.s32 %r1, 2;
            st.global.s32 [out], %r0;
            mov.s32 %r2, 3;
            add.s32 %r1, %r1, %r2;
            st.global.s32 [out], %r1;
            ret;",
    )
    .unwrap();
    let options = TranslationOptions { register_count: Some(2), ..Default::default() };
    let optimized = optimize(kernel, &options).unwrap();

    let allocation = &optimized.allocation;
    assert!(!allocation.has_spills());
    let reg = |n| match allocation.location(gpuopt::VReg(n)) {
        Some(Location::Register(r)) => r,
        other => panic!("%r{n} not in a register: {other:?}"),
    };
    assert_ne!(reg(0), reg(1));
    assert_ne!(reg(1), reg(2));
    assert_eq!(reg(0), reg(2));
}

#[test]
fn test_every_level_translates() {
    init();
    for level in OptimizationLevel::ALL {
        let translator = Translator::new(Architecture::Ptx, Architecture::Ptx, level);
        let target = translator.translate(kernel()).unwrap();
        let code = target.code().unwrap();
        assert!(code.starts_with(".version 7.0\n"), "{level}: {code}");
        let barriers = code.matches("bar.sync").count();
        if level.implied_passes().contains(PassMask::REMOVE_BARRIERS)
            || level.implied_passes().contains(PassMask::SYNC_ELIMINATION)
        {
            assert_eq!(barriers, 1, "{level}");
        } else {
            assert_eq!(barriers, 2, "{level}");
        }
    }
}

#[test]
fn test_translation_is_deterministic() {
    init();
    let translator = Translator::new(Architecture::Ptx, Architecture::Amdil, OptimizationLevel::FullOptimization);
    let first = translator.translate(kernel()).unwrap();
    let second = translator.translate(kernel()).unwrap();
    assert_eq!(first.code().unwrap(), second.code().unwrap());
    assert_eq!(first.statements(), second.statements());
}

#[test]
fn test_stale_manual_mask_ignored() {
    init();
    let stale = TranslationOptions { passes: PassMask::REMOVE_BARRIERS, ..Default::default() };

    let arena = Bump::new();
    let session = TranslationSession::new(&arena);
    Translator::new(Architecture::Ptx, Architecture::Ptx, OptimizationLevel::AggressiveOptimization)
        .translate_in(&session, kernel(), &stale)
        .unwrap();
    let stats = session.stats();
    assert_eq!(stats.passes_applied, 4);
    for pass in Pass::CANONICAL_ORDER {
        assert!(stats.statements_rewritten.contains_key(pass.name()), "{pass} did not run");
    }

    let arena = Bump::new();
    let session = TranslationSession::new(&arena);
    let none = Translator::new(Architecture::Ptx, Architecture::Ptx, OptimizationLevel::NoOptimization)
        .translate_in(&session, kernel(), &stale)
        .unwrap();
    assert_eq!(session.stats().passes_applied, 0);
    assert_eq!(none.code().unwrap().matches("bar.sync").count(), 2);
}

#[test]
fn test_amdil_loops_and_diamonds() {
    init();
    let translator = Translator::new(Architecture::Ptx, Architecture::Amdil, OptimizationLevel::NoOptimization);

    let counted = parse_kernel(
        ".kernel counted .arch ptx
            mov.s32 %r0, 0;
        LOOP:
            add.s32 %r0, %r0, 1;
            setp.lt.s32 %r1, %r0, 8;
            @%r1 bra LOOP;
            st.global.s32 [out], %r0;
            ret;",
    )
    .unwrap();
    let code = translator.translate(counted).unwrap().code().unwrap().to_string();
    let whileloop = code.find("whileloop").unwrap();
    let endloop = code.find("endloop").unwrap();
    assert!(whileloop < code.find("break_logicalz").unwrap());
    assert!(code.find("break_logicalz").unwrap() < endloop);

    let diamond = parse_kernel(
        ".kernel diamond .arch ptx
            setp.eq.s32 %r0, %tid.x, 0;
            @%r0 bra ELSE;
            st.shared.s32 [buf], 1;
            bra JOIN;
        ELSE:
            st.shared.s32 [buf], 2;
        JOIN:
            bar.sync 0;
            ret;",
    )
    .unwrap();
    let code = translator.translate(diamond).unwrap().code().unwrap().to_string();
    let lines: Vec<&str> = code.lines().map(str::trim).collect();
    let open = lines.iter().position(|l| l.starts_with("if_logicalz")).unwrap();
    assert_eq!(lines[open + 1], "lds_store_id(1) buf, 1");
    assert_eq!(lines[open + 2], "else");
    assert_eq!(lines[open + 4], "lds_store_id(1) buf, 2");
    assert_eq!(lines[open + 5], "endif");
}

#[test]
fn test_failures_leave_no_output() {
    init();
    let options = TranslationOptions { register_count: Some(0), ..Default::default() };
    let err = Translator::new(Architecture::Ptx, Architecture::Ptx, OptimizationLevel::BasicOptimization)
        .translate_with(kernel(), &options)
        .unwrap_err();
    assert_eq!(err, TranslateError::Config(ConfigError::ZeroRegisterBudget));

    let err = Translator::new(Architecture::Ptx, Architecture::Emulated, OptimizationLevel::BasicOptimization)
        .translate(kernel())
        .unwrap_err();
    assert_eq!(
        err,
        TranslateError::Config(ConfigError::UnsupportedPair { from: Architecture::Ptx, to: Architecture::Emulated })
    );
}

#[test]
fn test_budget_below_statement_width() {
    init();
    let kernel = parse_kernel(
        ".kernel wide
            mov.s32 %r0, 1;
            mov.s32 %r1, 2;
            mov.s32 %r2, 3;
            mad.s32 %r3, %r0, %r1, %r2;
            st.global.s32 [out], %r3;
            ret;",
    )
    .unwrap();
    let err = Translator::new(Architecture::Ptx, Architecture::Ptx, OptimizationLevel::NoOptimization)
        .with_register_budget(3)
        .translate(kernel)
        .unwrap_err();
    assert_eq!(err.phase(), Phase::Allocation);
    assert!(matches!(err, TranslateError::Allocation(AllocError::InsufficientRegisters { needed: 4, budget: 3, .. })));
}

#[test]
fn test_session_across_kernels() {
    init();
    let arena = Bump::new();
    let session = TranslationSession::new(&arena);
    let translator = Translator::new(Architecture::Ptx, Architecture::Ptx, OptimizationLevel::SpaceOptimization);
    let options = TranslationOptions::default();

    translator.translate_in(&session, kernel(), &options).unwrap();
    translator
        .translate_in(&session, parse_kernel(".kernel tiny\n ret;").unwrap(), &options)
        .unwrap();

    let stats = session.stats();
    assert_eq!(stats.kernels_translated, 2);
    assert_eq!(stats.passes_applied, 4);
    assert_eq!(stats.largest_kernel_name, "reduce");
    assert!(stats.to_string().starts_with("Translation Session Statistics:\n"));
}

#[test]
fn test_cfg_attached_on_request() {
    init();
    let options = TranslationOptions { cfg: true, ..Default::default() };
    let target = Translator::new(Architecture::Ptx, Architecture::Ptx, OptimizationLevel::NoOptimization)
        .translate_with(kernel(), &options)
        .unwrap();
    let dot = target.cfg().unwrap();
    assert!(dot.starts_with("digraph \"reduce\" {"));
    assert!(dot.contains("[style=solid]"));
    assert!(dot.contains("[style=dashed]"));
}
