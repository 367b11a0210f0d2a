use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use powerline_engine::{Powerline, PowerlineOptions, RenderRequest, RendererKind, SegmentInfo};
use serde_json::json;
use std::fs;
use std::path::Path;
use tempfile::TempDir;

fn write(dir: &Path, name: &str, value: serde_json::Value) {
    let path = dir.join(name);
    fs::create_dir_all(path.parent().unwrap()).unwrap();
    fs::write(path, value.to_string()).unwrap();
}

/// A config tree whose only theme holds `count` string segments with
/// alternating backgrounds and increasing priorities.
fn setup(count: usize) -> TempDir {
    let dir = TempDir::new().unwrap();
    write(dir.path(), "config.json", json!({"ext": {"bench": {"theme": "wide"}}}));
    write(dir.path(), "colors.json", json!({"colors": {"black": 16, "white": 231, "gray": 240}}));
    write(
        dir.path(),
        "colorschemes/default.json",
        json!({"groups": {
            "even": {"fg": "white", "bg": "black"},
            "odd": {"fg": "white", "bg": "gray", "attrs": ["bold"]}
        }}),
    );
    write(dir.path(), "themes/powerline.json", json!({}));
    let segments: Vec<_> = (0..count)
        .map(|i| {
            json!({
                "type": "string",
                "contents": format!("segment-{}", i),
                "priority": (i % 17) as f64,
                "highlight_groups": [if i % 2 == 0 { "even" } else { "odd" }]
            })
        })
        .collect();
    write(dir.path(), "themes/bench/wide.json", json!({"segments": {"left": segments}}));
    dir
}

fn powerline(dir: &Path, kind: RendererKind) -> Powerline {
    let mut options = PowerlineOptions::new("bench", kind);
    options.run_once = true;
    options.config_paths = Some(vec![dir.to_path_buf()]);
    Powerline::new(options).unwrap()
}

fn bench_full_line(c: &mut Criterion) {
    let mut group = c.benchmark_group("render_full_line");
    for count in [10usize, 50, 200] {
        let dir = setup(count);
        let powerline = powerline(dir.path(), RendererKind::Ansi);
        let info = SegmentInfo::default();
        group.bench_with_input(BenchmarkId::from_parameter(count), &count, |b, _| {
            b.iter(|| black_box(powerline.render(&RenderRequest::new(&info))))
        });
    }
    group.finish();
}

fn bench_width_fitting(c: &mut Criterion) {
    let mut group = c.benchmark_group("render_fit_width");
    for count in [50usize, 200] {
        let dir = setup(count);
        let powerline = powerline(dir.path(), RendererKind::Tmux);
        let info = SegmentInfo::default();
        let request = RenderRequest {
            width: Some(120),
            ..RenderRequest::new(&info)
        };
        group.bench_with_input(BenchmarkId::from_parameter(count), &count, |b, _| {
            b.iter(|| black_box(powerline.render(&request)))
        });
    }
    group.finish();
}

criterion_group!(benches, bench_full_line, bench_width_fitting);
criterion_main!(benches);
