use briny_graph::approx::{ApproxEquality, approx_within};
use briny_graph::prelude::*;
use rand::Rng;

fn random_data(n: usize) -> Vec<f32> {
    let mut rng = rand::rng();
    (0..n).map(|_| rng.random_range(-1.0..1.0)).collect()
}

/// A small mixed pipeline: matmul, broadcast, unary, reduction and layout.
fn pipeline(s: &mut Session, x: &[f32], w: &[f32]) -> NodeId {
    let x = s.create(x, &[8, 16]).unwrap();
    let w = s.create(w, &[16, 4]).unwrap();
    let bias = s.arange(&[4], 0).unwrap();
    let h = s.matmul(x, w).unwrap();
    let h = s.add(h, bias).unwrap();
    let h = s.sin(h).unwrap();
    let t = s.transpose_last2(h).unwrap();
    let r = s.reduce_sum(t, 1).unwrap();
    s.mul_scalar(r, 0.5).unwrap()
}

#[test]
fn test_eager_and_lazy_agree() {
    let x = random_data(128);
    let w = random_data(64);

    let mut lazy = Session::new();
    let out = pipeline(&mut lazy, &x, &w);
    assert!(!lazy.is_materialized(out).unwrap());
    let deferred = lazy.read::<f32>(out).unwrap();

    let mut eager = Session::with_config(SessionConfig::default().with_eager(true)).unwrap();
    let out = pipeline(&mut eager, &x, &w);
    assert!(eager.is_materialized(out).unwrap());
    let immediate = eager.read::<f32>(out).unwrap();

    assert_eq!(deferred.len(), 4);
    assert!(approx_within(&deferred, &immediate, ApproxEquality::Precise));
}

#[test]
fn test_eager_toggle_applies_to_new_nodes() {
    let mut s = Session::new();
    let a = s.create(&[1i32, 2, 3], &[3]).unwrap();
    let b = s.neg(a).unwrap();
    assert!(!s.is_materialized(b).unwrap());
    s.set_eager(true);
    let c = s.abs(b).unwrap();
    // `b` is still deferred, so `c` waits for an explicit request
    assert!(!s.is_materialized(c).unwrap());
    let d = s.add(a, a).unwrap();
    assert!(s.is_materialized(d).unwrap());
    assert_eq!(s.read::<i32>(c).unwrap(), vec![1, 2, 3]);
}

#[test]
fn test_small_cpu_chunks_match_default() {
    let data = random_data(4096);
    let run = |config: SessionConfig| {
        let mut s = Session::with_config(config).unwrap();
        let a = s.create(&data, &[64, 64]).unwrap();
        let b = s.sin(a).unwrap();
        let c = s.matmul(b, a).unwrap();
        let d = s.reduce_max(c, 0).unwrap();
        s.read::<f32>(d).unwrap()
    };
    let chunked = run(SessionConfig::default().with_cpu_chunk(7));
    let whole = run(SessionConfig::default());
    assert_eq!(chunked, whole);
}

#[test]
fn test_integer_overflow_wraps() {
    let mut s = Session::new();
    let a = s.create(&[i32::MAX, i32::MIN, 7], &[3]).unwrap();
    let inc = s.add_scalar(a, 1).unwrap();
    let dec = s.sub_scalar(a, 1).unwrap();
    let dbl = s.mul_scalar(a, 2).unwrap();
    let neg = s.neg(a).unwrap();
    let abs = s.abs(a).unwrap();
    assert_eq!(s.read::<i32>(inc).unwrap(), vec![i32::MIN, i32::MIN + 1, 8]);
    assert_eq!(s.read::<i32>(dec).unwrap(), vec![i32::MAX - 1, i32::MAX, 6]);
    assert_eq!(s.read::<i32>(dbl).unwrap(), vec![-2, 0, 14]);
    assert_eq!(s.read::<i32>(neg).unwrap(), vec![i32::MIN + 1, i32::MIN, -7]);
    assert_eq!(s.read::<i32>(abs).unwrap(), vec![i32::MAX, i32::MIN, 7]);

    let b = s.create(&[i32::MAX, 1], &[2]).unwrap();
    let sum = s.reduce_sum(b, 0).unwrap();
    assert_eq!(s.read::<i32>(sum).unwrap(), vec![i32::MIN]);
    let w = s.create(&[i64::MAX, 2], &[2]).unwrap();
    let prod = s.reduce_mul(w, 0).unwrap();
    assert_eq!(s.read::<i64>(prod).unwrap(), vec![-2]);
}

#[test]
fn test_pow_of_negative_base() {
    let mut s = Session::new();
    let x = s.create(&[-2.0f32, -3.0, 4.0, -1.5], &[4]).unwrap();
    let e = s.create(&[3.0f32, 2.0, 0.5, 2.0], &[4]).unwrap();
    let p = s.pow(x, e).unwrap();
    assert_eq!(s.read::<f32>(p).unwrap(), vec![-8.0, 9.0, 2.0, 2.25]);

    let i = s.create(&[-2i32, -3, 5], &[3]).unwrap();
    let cube = s.pow_scalar(i, 3).unwrap();
    assert_eq!(s.read::<i32>(cube).unwrap(), vec![-8, -27, 125]);
}

#[test]
fn test_default_session_runs_on_cpu() {
    let s = Session::new();
    assert_eq!(s.backends(), Backends::CPU);
    assert!(!s.config().eager);
}

#[cfg(not(feature = "wgpu"))]
#[test]
fn test_accelerator_requires_feature() {
    let cfg = SessionConfig::default().with_backends(Backends::ALL);
    assert!(matches!(
        Session::with_config(cfg),
        Err(GraphError::BackendUnavailable(Backend::Wgpu))
    ));
}

#[cfg(feature = "wgpu")]
#[test]
fn test_accelerator_matches_cpu() {
    let cfg = SessionConfig::default()
        .with_backends(Backends::ALL)
        .with_thresholds(0, 0);
    let mut gpu = Session::with_config(cfg).unwrap();
    if !gpu.backends().contains(Backend::Wgpu) {
        return;
    }
    let x = random_data(128);
    let w = random_data(64);
    let on_gpu = {
        let out = pipeline(&mut gpu, &x, &w);
        gpu.read::<f32>(out).unwrap()
    };
    let mut cpu = Session::new();
    let out = pipeline(&mut cpu, &x, &w);
    let on_cpu = cpu.read::<f32>(out).unwrap();
    assert!(approx_within(&on_gpu, &on_cpu, ApproxEquality::Relative));
}

#[cfg(feature = "wgpu")]
#[test]
fn test_accelerator_pow_of_negative_base_matches_cpu() {
    let cfg = SessionConfig::default()
        .with_backends(Backends::ALL)
        .with_thresholds(0, 0);
    let mut gpu = Session::with_config(cfg).unwrap();
    if !gpu.backends().contains(Backend::Wgpu) {
        return;
    }
    let base = [-2.0f32, -3.0, 4.0, -1.5, -0.5, 2.5];
    let exps = [3.0f32, 2.0, 0.5, 2.0, 5.0, 1.0];
    let run = |s: &mut Session| {
        let x = s.create(&base, &[6]).unwrap();
        let e = s.create(&exps, &[6]).unwrap();
        let p = s.pow(x, e).unwrap();
        s.read::<f32>(p).unwrap()
    };
    let on_gpu = run(&mut gpu);
    let on_cpu = run(&mut Session::new());
    assert!(on_gpu.iter().all(|v| v.is_finite()), "{on_gpu:?}");
    assert!(approx_within(&on_gpu, &on_cpu, ApproxEquality::Relative));
}
