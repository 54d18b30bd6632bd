//! Properties every pass must keep.

use gpuopt::{apply_passes, parse_kernel, Kernel, Pass, PassMask};

const KERNELS: &[&str] = &[
    ".kernel straight
        mov.s32 %r0, %tid.x;
        st.shared.s32 [buf], %r0;
        bar.sync 0;
        bar.sync 0;
        ld.shared.s32 %r1, [buf+4];
        st.global.s32 [out], %r1;
        bar.sync 0;
        ret;",
    ".kernel flattened
        ld.global.s32 %r0, [in];
        setp.gt.s32 %r1, %r0, 0;
        @%r1 mul.s32 %r0, %r0, 3;
        @%r1 add.s32 %r0, %r0, 1;
        @%r1 st.global.s32 [out], %r0;
        bra NEXT;
    NEXT:
        ret;",
    ".kernel looped
        mov.s32 %r0, 0;
    LOOP:
        ld.shared.s32 %r1, [buf];
        bar.sync 0;
        st.shared.s32 [buf], %r1;
        add.s32 %r0, %r0, 1;
        setp.lt.s32 %r2, %r0, 8;
        @%r2 bra LOOP;
        bar.sync 0;
        ret;",
];

fn kernels() -> Vec<Kernel> {
    KERNELS.iter().map(|text| parse_kernel(text).unwrap()).collect()
}

#[test]
fn test_each_pass_is_idempotent() {
    let _ = env_logger::builder().is_test(true).try_init();
    for pass in Pass::CANONICAL_ORDER {
        for mut kernel in kernels() {
            pass.run(&mut kernel);
            let once = kernel.clone();
            assert_eq!(pass.run(&mut kernel), 0, "{pass} on `{}`", kernel.name());
            assert_eq!(kernel, once);
        }
    }
}

#[test]
fn test_all_passes_keep_invariants() {
    for mut kernel in kernels() {
        let registers = kernel.register_count();
        let report = apply_passes(&mut kernel, PassMask::ALL).unwrap();
        assert_eq!(report.runs.len(), 4);
        assert!(kernel.verify().is_ok());
        assert_eq!(kernel.register_count(), registers);
    }
}

#[test]
fn test_printed_kernels_reparse() {
    for mut kernel in kernels() {
        apply_passes(&mut kernel, PassMask::ALL).unwrap();
        let reparsed = parse_kernel(&kernel.to_string()).unwrap();
        assert_eq!(reparsed.statements(), kernel.statements());
        assert_eq!(reparsed.name(), kernel.name());
    }
}

#[test]
fn test_mask_order_does_not_matter() {
    let a: PassMask = "sync-elimination,remove-barriers".parse().unwrap();
    let b: PassMask = "remove-barriers|sync-elimination".parse().unwrap();
    for kernel in kernels() {
        let (mut x, mut y) = (kernel.clone(), kernel);
        apply_passes(&mut x, a).unwrap();
        apply_passes(&mut y, b).unwrap();
        assert_eq!(x, y);
    }
}
