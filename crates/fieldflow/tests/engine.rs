//! End-to-end checks of the formula → grid pipeline.

use fieldflow::{
    BatchOptions, CancelToken, ConstantAggregate, ConstantDefinition, EvaluationContext, Frame,
    FrameSource, MemorySource, RenderRequest, Validator, compute_custom_constants,
    compute_render_data, context_with_global_statistics, dataset_context,
};

const N: usize = 13;

/// Lattice frame whose points coincide with an (N, N) evaluation grid.
fn lattice_frame(time_key: f64) -> Frame {
    let mut xs = Vec::new();
    let mut ys = Vec::new();
    let mut p = Vec::new();
    let mut u = Vec::new();
    let mut v = Vec::new();
    for r in 0..N {
        for c in 0..N {
            let x = c as f64 / (N - 1) as f64;
            let y = r as f64 / (N - 1) as f64;
            xs.push(x);
            ys.push(y);
            p.push(x * x + y * y);
            u.push(-y);
            v.push(x);
        }
    }
    Frame::new(
        time_key,
        vec![("x", xs), ("y", ys), ("p", p), ("u", u), ("v", v)],
    )
    .expect("frame")
}

fn request(heatmap: &str) -> RenderRequest {
    RenderRequest {
        x_formula: "x".to_owned(),
        y_formula: "y".to_owned(),
        heatmap_formula: Some(heatmap.to_owned()),
        contour_formula: None,
        vector_u_formula: None,
        vector_v_formula: None,
        resolution: (N, N),
        use_gpu: false,
    }
}

fn context() -> EvaluationContext {
    EvaluationContext::from_variables(["x", "y", "p", "u", "v"].map(str::to_owned))
}

#[test]
fn all_fields_of_a_request_share_one_grid() {
    let frame = lattice_frame(0.0);
    let request = RenderRequest {
        x_formula: "x".to_owned(),
        y_formula: "y".to_owned(),
        heatmap_formula: Some("p".to_owned()),
        contour_formula: Some("laplacian(p)".to_owned()),
        vector_u_formula: Some("u".to_owned()),
        vector_v_formula: Some("v".to_owned()),
        resolution: (N, N),
        use_gpu: false,
    };
    let data = compute_render_data(&frame, &context(), &request).expect("render");

    assert_eq!(data.grid.shape(), (N, N));
    for field in [
        data.heatmap.as_ref(),
        data.contour.as_ref(),
        data.vector_u.as_ref(),
        data.vector_v.as_ref(),
    ] {
        let field = field.expect("field present");
        assert_eq!(field.values.shape(), data.grid.shape());
    }
}

#[test]
fn absent_and_empty_formulas_yield_no_field() {
    let frame = lattice_frame(0.0);
    let mut req = request("p");
    req.contour_formula = Some("   ".to_owned());
    let data = compute_render_data(&frame, &context(), &req).expect("render");
    assert!(data.heatmap.is_some());
    assert!(data.contour.is_none());
    assert!(data.vector_u.is_none());
}

#[test]
fn constant_formula_broadcasts_over_the_grid() {
    let frame = lattice_frame(0.0);
    let data = compute_render_data(&frame, &context(), &request("2 * pi")).expect("render");
    let heatmap = data.heatmap.expect("heatmap");
    for &value in heatmap.values.data() {
        assert!((value - 2.0 * std::f64::consts::PI).abs() < 1e-12);
    }
    assert!((heatmap.min - heatmap.max).abs() < 1e-12);
}

#[test]
fn mixed_scalar_and_spatial_formulas_agree_on_field_bounds() {
    let frame = lattice_frame(0.0);
    let data =
        compute_render_data(&frame, &context(), &request("curl(u, v)")).expect("render");
    let field = data.heatmap.expect("heatmap");
    assert!((field.min - 2.0).abs() < 1e-9);
    assert!((field.max - 2.0).abs() < 1e-9);
}

#[test]
fn render_is_idempotent_for_identical_inputs() {
    let frame = lattice_frame(0.0);
    let req = request("laplacian(p) + sin(x)");
    let first = compute_render_data(&frame, &context(), &req).expect("render");
    let second = compute_render_data(&frame, &context(), &req).expect("render");
    assert_eq!(first, second);
}

#[test]
fn validated_formulas_evaluate_without_surprises() {
    let frame = lattice_frame(0.0);
    let validator = Validator::new(context());
    for formula in [
        "p - mean(p)",
        "grad_x(curl(u, v))",
        "sqrt(abs(laplacian(p)))",
        "div(u, v) + std(p)",
    ] {
        validator.validate(formula).expect("validate");
        let data = compute_render_data(&frame, &context(), &request(formula)).expect(formula);
        assert!(data.heatmap.is_some(), "{formula}");
    }
}

#[test]
fn global_statistics_feed_the_formula_namespace() {
    let source = MemorySource::new(vec![lattice_frame(0.0), lattice_frame(1.0)])
        .expect("source");
    let context = context_with_global_statistics(&source, &CancelToken::new()).expect("context");

    assert!(context.has_constant("p_global_mean"));
    assert!(context.has_constant("u_global_min"));

    // centering a field on its dataset-wide mean is the canonical use
    let frame = source.frame(0).expect("frame");
    let data = compute_render_data(&frame, &context, &request("p - p_global_mean"))
        .expect("render");
    let field = data.heatmap.expect("heatmap");
    let p_mean = context.constant("p_global_mean").expect("constant");
    assert!(field.min >= -p_mean - 1e-9);
}

#[test]
fn custom_constants_extend_the_namespace_for_rendering() {
    let source = MemorySource::new(vec![lattice_frame(0.0), lattice_frame(1.0)])
        .expect("source");
    let base = dataset_context(&source);

    let defs = [ConstantDefinition {
        name: "mean_vorticity".to_owned(),
        aggregate: ConstantAggregate::Mean,
        expression: "curl(u, v)".to_owned(),
    }];
    let options = BatchOptions {
        spatial_resolution: (N, N),
        worker_cap: Some(2),
    };
    let computed =
        compute_custom_constants(&source, &base, &defs, &options, &CancelToken::new())
            .expect("constants");
    assert!((computed[0].1 - 2.0).abs() < 1e-6);

    let mut context = base;
    for (name, value) in computed {
        context = context.with_constant(name, value);
    }
    let frame = source.frame(0).expect("frame");
    let data = compute_render_data(&frame, &context, &request("curl(u, v) - mean_vorticity"))
        .expect("render");
    let field = data.heatmap.expect("heatmap");
    assert!(field.min.abs() < 1e-6 && field.max.abs() < 1e-6);
}

#[test]
fn render_requests_round_trip_through_serde() {
    let req = request("grad_x(curl(u, v))");
    let json = serde_json::to_string(&req).expect("serialize");
    let back: RenderRequest = serde_json::from_str(&json).expect("deserialize");
    assert_eq!(back, req);

    let frame = lattice_frame(0.0);
    let data = compute_render_data(&frame, &context(), &back).expect("render");
    assert_eq!(
        data.heatmap.expect("heatmap").values.shape(),
        data.grid.shape()
    );
}

#[test]
fn evaluation_errors_surface_with_their_kind() {
    let frame = lattice_frame(0.0);
    let err = compute_render_data(&frame, &context(), &request("div(u)")).expect_err("arity");
    assert!(err.to_string().contains("div"));

    let err =
        compute_render_data(&frame, &context(), &request("mystery(p)")).expect_err("unknown");
    assert!(err.to_string().contains("mystery"));
}
