//! 1D neighborhood attention tests against the naive reference

mod common;

use common::{assert_close, host_ctx, upload, Geometry, Inputs};
use nattenforge::backend::ComputeDevice;
use nattenforge::{fmha_forward, na1d_forward, HostContext, Na1dParams, TensorRef};

const TOL: f32 = 1e-5;

fn params_for(g: &Geometry) -> Na1dParams {
    Na1dParams::new(g.kernel[2])
        .with_dilation(g.dilation[2])
        .with_causal(g.causal)
        .with_original_length(g.original[2])
}

fn run(ctx: &HostContext, g: &Geometry, inputs: &Inputs) -> Vec<f32> {
    let device = ctx.device();
    let shape = vec![g.batch, g.heads, g.extent[2], g.dim];
    let q = upload(device, &inputs.query);
    let k = upload(device, &inputs.key);
    let v = upload(device, &inputs.value);
    let rpb = inputs.rpb.as_ref().map(|bias| upload(device, bias));
    let rpb_ref = rpb
        .as_ref()
        .map(|b| TensorRef::contiguous(b, vec![g.heads, 2 * g.kernel[2] - 1]));

    let out = na1d_forward(
        ctx,
        &TensorRef::contiguous(&q, shape.clone()),
        &TensorRef::contiguous(&k, shape.clone()),
        &TensorRef::contiguous(&v, shape),
        rpb_ref.as_ref(),
        &params_for(g),
    )
    .unwrap();

    assert_eq!(out.shape, vec![g.batch, g.extent[2], g.heads * g.dim]);
    let channels = (g.heads * g.dim) as isize;
    assert_eq!(out.strides, vec![g.extent[2] as isize * channels, channels, 1]);
    device.read_buffer(&out.buffer).unwrap()
}

#[test]
fn test_matches_reference() {
    let ctx = host_ctx();
    let g = Geometry::one_d(2, 3, 16, 8, 5);
    let inputs = Inputs::random(&g, 1, false);
    assert_close(&run(&ctx, &g, &inputs), &inputs.expected(&g), TOL);
}

#[test]
fn test_boundary_windows_length_8_kernel_3() {
    let ctx = host_ctx();
    let g = Geometry::one_d(1, 1, 8, 4, 3);
    let inputs = Inputs::random(&g, 2, false);
    assert_close(&run(&ctx, &g, &inputs), &inputs.expected(&g), TOL);
}

#[test]
fn test_causal_first_query_copies_its_own_value() {
    let ctx = host_ctx();
    let mut g = Geometry::one_d(2, 2, 8, 4, 3);
    g.causal = true;
    let inputs = Inputs::random(&g, 3, true);
    let out = run(&ctx, &g, &inputs);
    assert_close(&out, &inputs.expected(&g), TOL);

    // Query 0 sees only key 0, so its weight is exactly one.
    for b in 0..g.batch {
        for h in 0..g.heads {
            for d in 0..g.dim {
                let got = out[b * 8 * g.heads * g.dim + h * g.dim + d];
                let want = inputs.value[((b * g.heads + h) * 8) * g.dim + d];
                assert_eq!(got, want);
            }
        }
    }
}

#[test]
fn test_dilation_with_bias() {
    let ctx = host_ctx();
    let mut g = Geometry::one_d(1, 2, 20, 6, 3);
    g.dilation = [1, 1, 3];
    let inputs = Inputs::random(&g, 4, true);
    assert_close(&run(&ctx, &g, &inputs), &inputs.expected(&g), TOL);
}

#[test]
fn test_causal_dilated() {
    let ctx = host_ctx();
    let mut g = Geometry::one_d(2, 1, 17, 4, 4);
    g.dilation = [1, 1, 2];
    g.causal = true;
    let inputs = Inputs::random(&g, 5, true);
    assert_close(&run(&ctx, &g, &inputs), &inputs.expected(&g), TOL);
}

#[test]
fn test_padded_sequence_uses_original_length() {
    let ctx = host_ctx();
    let mut g = Geometry::one_d(1, 2, 12, 4, 3);
    g.original = [1, 1, 9];
    let inputs = Inputs::random(&g, 6, true);
    assert_close(&run(&ctx, &g, &inputs), &inputs.expected(&g), TOL);
}

#[test]
fn test_token_major_strided_inputs() {
    let ctx = host_ctx();
    let device = ctx.device();
    let g = Geometry::one_d(2, 3, 10, 4, 3);
    let inputs = Inputs::random(&g, 7, false);
    let (b_n, h_n, l_n, d_n) = (g.batch, g.heads, 10, g.dim);

    // Store each tensor as [B, L, H, D] and view it as [B, H, L, D].
    let to_token_major = |data: &[f32]| {
        let mut out = vec![0.0; data.len()];
        for b in 0..b_n {
            for h in 0..h_n {
                for l in 0..l_n {
                    for d in 0..d_n {
                        out[((b * l_n + l) * h_n + h) * d_n + d] =
                            data[((b * h_n + h) * l_n + l) * d_n + d];
                    }
                }
            }
        }
        out
    };
    let q = upload(device, &to_token_major(&inputs.query));
    let k = upload(device, &to_token_major(&inputs.key));
    let v = upload(device, &to_token_major(&inputs.value));
    let shape = vec![b_n, h_n, l_n, d_n];
    let strides = vec![(l_n * h_n * d_n) as isize, d_n as isize, (h_n * d_n) as isize, 1];

    let out = na1d_forward(
        &ctx,
        &TensorRef::strided(&q, shape.clone(), strides.clone()),
        &TensorRef::strided(&k, shape.clone(), strides.clone()),
        &TensorRef::strided(&v, shape, strides),
        None,
        &Na1dParams::new(3),
    )
    .unwrap();
    assert_close(&device.read_buffer(&out.buffer).unwrap(), &inputs.expected(&g), TOL);
}

#[test]
fn test_offset_views_into_one_buffer() {
    let ctx = host_ctx();
    let device = ctx.device();
    let g = Geometry::one_d(1, 2, 9, 4, 5);
    let inputs = Inputs::random(&g, 8, false);
    let n = g.qkv_len();

    // q, k, v packed back to back after a 3-element header
    let mut packed = vec![9.0f32; 3];
    packed.extend_from_slice(&inputs.query);
    packed.extend_from_slice(&inputs.key);
    packed.extend_from_slice(&inputs.value);
    let buffer = upload(device, &packed);
    let shape = vec![1, 2, 9, 4];

    let out = na1d_forward(
        &ctx,
        &TensorRef::contiguous(&buffer, shape.clone()).with_offset(3),
        &TensorRef::contiguous(&buffer, shape.clone()).with_offset(3 + n),
        &TensorRef::contiguous(&buffer, shape).with_offset(3 + 2 * n),
        None,
        &Na1dParams::new(5),
    )
    .unwrap();
    assert_close(&device.read_buffer(&out.buffer).unwrap(), &inputs.expected(&g), TOL);
}

#[test]
fn test_unit_kernel_returns_values() {
    let ctx = host_ctx();
    let g = Geometry::one_d(1, 1, 6, 3, 1);
    let inputs = Inputs::random(&g, 9, false);
    let out = run(&ctx, &g, &inputs);
    assert_eq!(out, inputs.value);
}

#[test]
fn test_fmha_matches_full_window() {
    let ctx = host_ctx();
    let device = ctx.device();
    let g = Geometry::one_d(2, 2, 7, 4, 7);
    let inputs = Inputs::random(&g, 10, false);
    let expected = inputs.expected(&g);

    let shape = vec![2, 2, 7, 4];
    let q = upload(device, &inputs.query);
    let k = upload(device, &inputs.key);
    let v = upload(device, &inputs.value);
    let out = fmha_forward(
        &ctx,
        &TensorRef::contiguous(&q, shape.clone()),
        &TensorRef::contiguous(&k, shape.clone()),
        &TensorRef::contiguous(&v, shape),
    )
    .unwrap();
    let dense = device.read_buffer(&out.buffer).unwrap();
    assert_close(&dense, &expected, TOL);
    assert_eq!(dense, run(&ctx, &g, &inputs));
}
