use std::path::Path;
use std::process::Command;
use tempfile::TempDir;

fn write_vectors(path: &Path, rows: &[[f32; 3]]) {
    let mut bytes = Vec::new();
    bytes.extend_from_slice(&(rows.len() as u32).to_le_bytes());
    bytes.extend_from_slice(&3u32.to_le_bytes());
    for row in rows {
        for v in row {
            bytes.extend_from_slice(&v.to_le_bytes());
        }
    }
    std::fs::write(path, bytes).unwrap();
}

fn rpforest(args: &[&str]) -> std::process::Output {
    Command::new(env!("CARGO_BIN_EXE_rpforest"))
        .args(args)
        .env_remove("RPFOREST_INDEX")
        .env_remove("RPFOREST_SEARCH_K")
        .output()
        .expect("run rpforest")
}

fn stdout_json(output: &std::process::Output) -> serde_json::Value {
    assert!(
        output.status.success(),
        "stderr: {}",
        String::from_utf8_lossy(&output.stderr)
    );
    serde_json::from_slice(&output.stdout).expect("json on stdout")
}

#[test]
fn test_build_query_info_verify() {
    let dir = TempDir::new().unwrap();
    let input = dir.path().join("items.fvecs");
    let index = dir.path().join("items.rpf");
    let rows: Vec<[f32; 3]> = (0..50)
        .map(|i| {
            let x = i as f32;
            [x, (x * 0.3).sin(), 1.0]
        })
        .collect();
    write_vectors(&input, &rows);

    let built = rpforest(&[
        "build",
        "--input",
        input.to_str().unwrap(),
        "--output",
        index.to_str().unwrap(),
        "--metric",
        "euclidean",
        "--trees",
        "4",
    ]);
    assert!(built.status.success(), "{}", String::from_utf8_lossy(&built.stderr));

    let by_item = stdout_json(&rpforest(&[
        "query",
        "--index",
        index.to_str().unwrap(),
        "--item",
        "7",
        "-n",
        "3",
    ]));
    let results = by_item.as_array().unwrap();
    assert_eq!(results.len(), 3);
    assert_eq!(results[0]["id"], 7);

    let by_vector = stdout_json(&rpforest(&[
        "query",
        "--index",
        index.to_str().unwrap(),
        "--vector",
        "20.1,0,1",
        "-n",
        "1",
        "-k",
        "50",
    ]));
    assert_eq!(by_vector[0]["id"], 20);

    let info = stdout_json(&rpforest(&["info", "--index", index.to_str().unwrap()]));
    assert_eq!(info["header"]["n_items"], 50);
    assert_eq!(info["header"]["n_trees"], 4);
    assert_eq!(info["header"]["metric"], "euclidean");

    let verify = stdout_json(&rpforest(&["verify", "--index", index.to_str().unwrap()]));
    assert_eq!(verify["ok"], true);
}

#[test]
fn test_verify_fails_on_garbage() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("garbage.rpf");
    std::fs::write(&path, vec![0u8; 128]).unwrap();
    let output = rpforest(&["verify", "--index", path.to_str().unwrap()]);
    assert!(!output.status.success());
}
