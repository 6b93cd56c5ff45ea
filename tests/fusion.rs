use briny_graph::prelude::*;

const FORBIDDEN: [&str; 5] = ["ptr", "asm", "unsafe", "import", "std::"];

fn assert_valid(source: &str) {
    assert!(source.contains("fn main"));
    assert!(source.len() <= 65536);
    for bad in FORBIDDEN {
        assert!(!source.contains(bad), "generated kernel contains {bad:?}:\n{source}");
    }
}

#[test]
fn test_layout_chain_fuses_into_one_kernel() {
    let mut s = Session::new();
    let a = s.create(&[1.0f64, 2.0, 3.0, 4.0, 5.0, 6.0], &[2, 3]).unwrap();
    let t = s.transpose_last2(a).unwrap();
    let sl = s.slice(t, &[1, 0], &[3, 2]).unwrap();
    let r = s.repeat(sl, &[1, 2]).unwrap();
    let e = s.extend(r, &[3, 4], &[1, 0]).unwrap();
    let out = s.reduce_max(e, 1).unwrap();

    let kernel = s.fused_kernel(out).unwrap();
    assert_eq!(kernel.params, vec![a]);
    assert_eq!(kernel.len, 3);
    assert_eq!(kernel.dims[0], 3);
    assert_valid(kernel.source());
    assert!(kernel.source().contains("for (var"));
}

#[test]
fn test_every_elementwise_kind_renders() {
    let mut s = Session::new();
    let a = s.create(&[0.5f32, 0.25, 0.75], &[3]).unwrap();
    let i = s.create(&[1i64, -2, 3], &[3]).unwrap();
    let mut last = a;
    for op in [
        UnaryOp::Neg,
        UnaryOp::Abs,
        UnaryOp::Sqrt,
        UnaryOp::Log,
        UnaryOp::Log2,
        UnaryOp::Log10,
        UnaryOp::Exp,
        UnaryOp::Sin,
        UnaryOp::Cos,
        UnaryOp::Tan,
        UnaryOp::Asin,
        UnaryOp::Acos,
        UnaryOp::Atan,
    ] {
        last = s.unary(op, last).unwrap();
    }
    for op in [
        BinaryOp::Add,
        BinaryOp::Sub,
        BinaryOp::Mul,
        BinaryOp::Div,
        BinaryOp::Pow,
        BinaryOp::Min,
        BinaryOp::Max,
    ] {
        last = s.broadcast_binary(op, last, i, Broadcast::Trailing).unwrap();
    }
    let even = s.even(i).unwrap();
    let sign = s.sign(last).unwrap();
    let less = s.less(sign, even).unwrap();
    let kernel = s.fused_kernel(less).unwrap();
    assert_eq!(kernel.params, vec![a, i]);
    assert_valid(kernel.source());
}

#[test]
fn test_generators_are_inlined() {
    let mut s = Session::new();
    let r = s.random(&[4, 4], 3).unwrap();
    let g = s.arange(&[4, 4], 0).unwrap();
    let c = s.constant(2.0f32, &[4, 4]).unwrap();
    let x = s.mul(r, c).unwrap();
    let y = s.add(x, g).unwrap();
    let kernel = s.fused_kernel(y).unwrap();
    assert!(kernel.params.is_empty());
    assert!(kernel.source().contains("pcg_hash"));
    assert_valid(kernel.source());
}

#[test]
fn test_loop_kinds_read_parameters() {
    let mut s = Session::new();
    let image = s.create(&[1.0f32; 16], &[4, 4, 1]).unwrap();
    let kernel = s.create(&[1.0f32; 8], &[2, 2, 2, 1]).unwrap();
    let conv = s.convolve(image, kernel, &[1, 1]).unwrap();
    let compiled = s.fused_kernel(conv).unwrap();
    assert_eq!(compiled.params, vec![image, kernel]);
    assert_valid(compiled.source());

    let windows = s.sliding_window(image, &[2, 2, 1], &[2, 2, 1]).unwrap();
    s.execute(windows).unwrap();
    let back = s.unslide(windows, &[4, 4, 1], &[2, 2, 1]).unwrap();
    assert_valid(s.fused_kernel(back).unwrap().source());

    s.execute(conv).unwrap();
    let g1 = s.gradient_convolve1(kernel, conv, &[4, 4, 1], &[1, 1]).unwrap();
    let g2 = s.gradient_convolve2(image, conv, &[2, 2, 2, 1], &[1, 1]).unwrap();
    assert_valid(s.fused_kernel(g1).unwrap().source());
    assert_valid(s.fused_kernel(g2).unwrap().source());
}

#[test]
fn test_structural_cache_across_node_instances() {
    let mut s = Session::new();
    let build = |s: &mut Session, v: f64| {
        let a = s.create(&[v; 8], &[2, 4]).unwrap();
        let b = s.cos(a).unwrap();
        let c = s.concat(b, a, 0).unwrap();
        s.flatten(c).unwrap()
    };
    let first = build(&mut s, 1.0);
    let second = build(&mut s, 2.0);
    let k1 = s.fused_kernel(first).unwrap();
    let k2 = s.fused_kernel(second).unwrap();
    assert_eq!(k1.key, k2.key);
    assert!(std::sync::Arc::ptr_eq(&k1.source, &k2.source));
    assert_eq!(s.kernel_cache_stats(), (1, 1));

    let other = s.create(&[1.0f64; 8], &[8]).unwrap();
    let different = s.sin(other).unwrap();
    let k3 = s.fused_kernel(different).unwrap();
    assert_ne!(k3.key, k1.key);
    assert_eq!(s.kernel_cache_stats(), (1, 2));
}
