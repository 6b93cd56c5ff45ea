use briny_graph::approx::{ApproxEquality, approx_within};
use briny_graph::prelude::*;

fn t1(s: &mut Session) -> NodeId {
    s.create(&[-1.0f32, 0.0, 1.0, 2.0], &[2, 2]).unwrap()
}

fn t2(s: &mut Session) -> NodeId {
    s.create(&[0.0f64, 1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0], &[2, 2, 2]).unwrap()
}

fn gradient(s: &mut Session, output: NodeId, wrt: NodeId) -> Vec<f64> {
    let g = s.differentiate(output, wrt).unwrap().unwrap();
    assert_eq!(s.shape(g).unwrap(), s.shape(wrt).unwrap());
    s.read::<f64>(g).unwrap()
}

#[test]
fn test_gradient_add_sub() {
    let mut s = Session::new();
    let a = t1(&mut s);
    let b = t2(&mut s);
    s.mark(a).unwrap();
    let sum = s.add(a, b).unwrap();
    let dif = s.sub(a, b).unwrap();
    assert_eq!(gradient(&mut s, sum, a), vec![2.0; 4]);
    assert_eq!(gradient(&mut s, dif, a), vec![2.0; 4]);
}

#[test]
fn test_gradient_subtrahend_is_negated() {
    let mut s = Session::new();
    let a = t1(&mut s);
    let b = t2(&mut s);
    s.mark(b).unwrap();
    let dif = s.sub(a, b).unwrap();
    assert_eq!(gradient(&mut s, dif, b), vec![-1.0; 8]);
}

#[test]
fn test_gradient_mul() {
    let mut s = Session::new();
    let a = t1(&mut s);
    let b = t2(&mut s);
    s.mark(a).unwrap();
    s.mark(b).unwrap();
    let prod = s.mul(a, b).unwrap();
    let grads = s.differentiate_all(prod, &[a, b]).unwrap();
    let (da, db) = (grads[0].unwrap(), grads[1].unwrap());
    assert_eq!(s.read::<f64>(da).unwrap(), vec![4.0, 6.0, 8.0, 10.0]);
    assert_eq!(
        s.read::<f64>(db).unwrap(),
        vec![-1.0, 0.0, 1.0, 2.0, -1.0, 0.0, 1.0, 2.0]
    );
}

#[test]
fn test_gradient_div() {
    let mut s = Session::new();
    let x = s.create(&[-1.0f64, 3.0, 1.0, 2.0], &[2, 2]).unwrap();
    let y = s
        .create(&[1.0f64, 1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0], &[2, 2, 2])
        .unwrap();
    s.mark(x).unwrap();
    s.mark(y).unwrap();

    let q = s.div(y, x).unwrap();
    let dx = gradient(&mut s, q, x);
    let expected = [-5.0, -6.0 / 9.0, -8.0, -2.5];
    assert!(approx_within(&dx[..], &expected[..], ApproxEquality::Partial));
    let dy = gradient(&mut s, q, y);
    assert_eq!(dy[0], -1.0);
    assert_eq!(dy[2], 1.0);
    assert_eq!(dy[3], 0.5);

    let r = s.div(x, y).unwrap();
    let dy = gradient(&mut s, r, y);
    assert_eq!(dy[0], 1.0);
    assert_eq!(dy[1], -3.0);
    assert!(approx_within(&dy[5], &-0.12, ApproxEquality::Partial));
    let dx = gradient(&mut s, r, x);
    assert!(approx_within(&dx[0], &1.25, ApproxEquality::Partial));
    assert!(approx_within(&dx[1], &1.2, ApproxEquality::Partial));
}

#[test]
fn test_gradient_matmul() {
    let mut s = Session::new();
    let x = s
        .create(&[1.0f64, 1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0], &[2, 2, 2])
        .unwrap();
    let y = s.create(&[3.0f64, -7.0, -1.0, 5.0], &[2, 2]).unwrap();
    s.mark(x).unwrap();
    s.mark(y).unwrap();
    let xy = s.matmul(x, y).unwrap();
    let yx = s.matmul(y, x).unwrap();

    assert_eq!(gradient(&mut s, xy, x), [-4.0, 4.0].repeat(4));
    assert_eq!(
        gradient(&mut s, yx, x),
        vec![2.0, 2.0, -2.0, -2.0, 2.0, 2.0, -2.0, -2.0]
    );
    assert_eq!(gradient(&mut s, xy, y), vec![13.0, 13.0, 16.0, 16.0]);
    assert_eq!(gradient(&mut s, yx, y), vec![11.0, 18.0, 11.0, 18.0]);
}

#[test]
fn test_gradient_matches_transpose_reference() {
    let mut s = Session::new();
    let x = s.create(&[1.0f64, 2.0, 3.0, 4.0, 5.0, 6.0], &[2, 3]).unwrap();
    let y = s.create(&[1.0f64, 0.0, -1.0, 2.0, 0.5, 1.0], &[3, 2]).unwrap();
    s.mark(x).unwrap();
    let z = s.matmul(x, y).unwrap();
    let sq = s.mul(z, z).unwrap();
    let dx = gradient(&mut s, sq, x);

    // d(sum z^2)/dx = (2z) y^T
    let z2 = s.mul_scalar(z, 2.0).unwrap();
    let yt = s.transpose_last2(y).unwrap();
    let reference = s.matmul(z2, yt).unwrap();
    assert_eq!(dx, s.read::<f64>(reference).unwrap());
}

#[test]
fn test_gradient_of_unary_chain() {
    let mut s = Session::new();
    let x = s.create(&[0.5f64, 1.0, 2.0], &[3]).unwrap();
    s.mark(x).unwrap();
    let l = s.log(x).unwrap();
    let e = s.exp(l).unwrap();
    let sq = s.sqrt(e).unwrap();
    // sqrt(exp(log x)) = sqrt(x)
    let dx = gradient(&mut s, sq, x);
    let expected: Vec<f64> = [0.5f64, 1.0, 2.0].iter().map(|v| 0.5 / v.sqrt()).collect();
    assert!(approx_within(&dx, &expected, ApproxEquality::Partial));
}

#[test]
fn test_gradient_of_reductions() {
    let mut s = Session::new();
    let x = s.create(&[1.0f64, 4.0, 2.0, 3.0], &[2, 2]).unwrap();
    s.mark(x).unwrap();
    let m = s.reduce_max(x, 1).unwrap();
    assert_eq!(gradient(&mut s, m, x), vec![0.0, 1.0, 0.0, 1.0]);
    let p = s.reduce_mul(x, 0).unwrap();
    assert_eq!(gradient(&mut s, p, x), vec![2.0, 3.0, 1.0, 4.0]);
}

#[test]
fn test_gradient_through_layout_ops() {
    let mut s = Session::new();
    let x = s.create(&[1.0f64, 2.0, 3.0, 4.0, 5.0, 6.0], &[2, 3]).unwrap();
    s.mark(x).unwrap();
    let sl = s.slice(x, &[0, 1], &[2, 3]).unwrap();
    let t = s.transpose_last2(sl).unwrap();
    let r = s.repeat(t, &[2, 1]).unwrap();
    assert_eq!(gradient(&mut s, r, x), vec![0.0, 2.0, 2.0, 0.0, 2.0, 2.0]);

    let y = s.create(&[1.0f64, 1.0], &[2, 1]).unwrap();
    s.mark(y).unwrap();
    let c = s.concat(x, y, 1).unwrap();
    let w = s.mul(c, c).unwrap();
    assert_eq!(gradient(&mut s, w, y), vec![2.0, 2.0]);
}

#[test]
fn test_gradient_of_convolution() {
    let mut s = Session::new();
    let image = s.create(&[1.0f64, 2.0, 3.0, 4.0], &[4, 1]).unwrap();
    let kernel = s.create(&[1.0f64, -1.0], &[2, 1]).unwrap();
    s.mark(image).unwrap();
    s.mark(kernel).unwrap();
    let c = s.convolve(image, kernel, &[1]).unwrap();
    // inner elements see both taps, which cancel; the first only sees tap 0
    assert_eq!(gradient(&mut s, c, image), vec![1.0, 0.0, 0.0, 0.0]);
    // tap k sums the image elements it visits
    assert_eq!(gradient(&mut s, c, kernel), vec![10.0, 9.0]);
}

#[test]
fn test_second_derivative() {
    let mut s = Session::new();
    let x = s.create(&[3.0f64], &[1]).unwrap();
    s.mark(x).unwrap();
    let x2 = s.mul(x, x).unwrap();
    let x3 = s.mul(x2, x).unwrap();
    let d1 = s.differentiate(x3, x).unwrap().unwrap();
    let d2 = s.differentiate(d1, x).unwrap().unwrap();
    assert_eq!(s.read::<f64>(d1).unwrap(), vec![27.0]);
    assert_eq!(s.read::<f64>(d2).unwrap(), vec![18.0]);
}

#[test]
fn test_missing_derivative_is_none() {
    let mut s = Session::new();
    let a = s.create(&[1.0f64], &[1]).unwrap();
    let b = s.create(&[2.0f64], &[1]).unwrap();
    s.mark(a).unwrap();
    s.mark(b).unwrap();
    let y = s.exp(a).unwrap();
    assert_eq!(s.differentiate(y, b).unwrap(), None);
}

#[test]
fn test_gradient_trace() {
    let mut s = Session::new();
    let a = s.create(&[1.0f64], &[1]).unwrap();
    let b = s.create(&[2.0f64], &[1]).unwrap();
    s.mark(a).unwrap();
    let c = s.add(a, b).unwrap();
    assert_eq!(s.gradient_trace(c).unwrap(), vec![a]);
    s.unmark(a).unwrap();
    assert!(s.gradient_trace(c).unwrap().is_empty());
}

#[test]
fn test_differentiation_frees_temporaries() {
    let mut s = Session::new();
    let x = s.create(&[1.0f64, 2.0], &[2]).unwrap();
    s.mark(x).unwrap();
    let a = s.sin(x).unwrap();
    let b = s.mul(a, x).unwrap();
    let before = s.live_nodes();
    let g = s.differentiate(b, x).unwrap().unwrap();
    s.release(g);
    assert_eq!(s.live_nodes(), before);
    assert!(s.contains(b));
}

#[test]
fn test_diamond_accumulates_every_consumer() {
    let mut s = Session::new();
    let x = s.create(&[2.0f64], &[1]).unwrap();
    s.mark(x).unwrap();
    let b = s.mul_scalar(x, 2.0).unwrap();
    let c = s.mul(b, x).unwrap();
    let d = s.add(c, b).unwrap();
    // d = 2x^2 + 2x
    assert_eq!(gradient(&mut s, d, x), vec![10.0]);
}
