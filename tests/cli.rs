use safetensors::SafeTensors;
use std::path::Path;
use std::process::Command;

const TINY_CONFIG: &str = "\
n_symbols: 20
symbols_embedding_dim: 4
encoder_embedding_dim: 4
encoder_n_convolutions: 1
encoder_kernel_size: 3
n_mel_channels: 3
attention_rnn_dim: 6
decoder_rnn_dim: 6
prenet_dim: 5
attention_dim: 4
attention_location_n_filters: 2
attention_location_kernel_size: 3
postnet_embedding_dim: 4
postnet_kernel_size: 3
postnet_n_convolutions: 2
max_decoder_steps: 6
";

fn write_config(dir: &Path, contents: &str) -> std::path::PathBuf {
    let path = dir.join("hparams.yaml");
    std::fs::write(&path, contents).expect("write config");
    path
}

fn tacotron() -> Command {
    Command::new(env!("CARGO_BIN_EXE_tacotron"))
}

#[test]
fn config_prints_merged_hyperparameters() {
    let dir = tempfile::tempdir().expect("tempdir");
    let config = write_config(dir.path(), TINY_CONFIG);
    let output = tacotron()
        .args(["config", "--config", config.to_str().unwrap()])
        .output()
        .expect("run config");
    assert!(output.status.success());
    let stdout = String::from_utf8(output.stdout).expect("utf8");
    assert!(stdout.contains("n_mel_channels: 3"));
    assert!(stdout.contains("gate_threshold: 0.5"));
}

#[test]
fn config_rejects_unknown_keys() {
    let dir = tempfile::tempdir().expect("tempdir");
    let config = write_config(dir.path(), "not_a_param: 1\n");
    let status = tacotron()
        .args(["config", "--config", config.to_str().unwrap()])
        .status()
        .expect("run config");
    assert!(!status.success());
}

#[test]
fn synthesize_writes_mel_and_alignment_per_sequence() {
    let dir = tempfile::tempdir().expect("tempdir");
    let config = write_config(dir.path(), TINY_CONFIG);
    let out = dir.path().join("out");
    let status = tacotron()
        .args([
            "synthesize",
            "--config",
            config.to_str().unwrap(),
            "--symbols",
            "1,2,3",
            "--symbols",
            "4,5",
            "--output-dir",
            out.to_str().unwrap(),
        ])
        .status()
        .expect("run synthesize");
    assert!(status.success());

    for index in 0..2 {
        let bytes = std::fs::read(out.join(format!("mel_{index}.safetensors"))).expect("mel");
        let tensors = SafeTensors::deserialize(&bytes).expect("safetensors");
        let mel = tensors.tensor("mel").expect("mel tensor");
        assert_eq!(mel.shape()[0], 3);
        assert!(mel.shape()[1] >= 1 && mel.shape()[1] <= 6);

        let bytes =
            std::fs::read(out.join(format!("alignment_{index}.safetensors"))).expect("alignment");
        let tensors = SafeTensors::deserialize(&bytes).expect("safetensors");
        let alignment = tensors.tensor("alignment").expect("alignment tensor");
        assert_eq!(alignment.shape()[0], mel.shape()[1]);
        assert_eq!(alignment.shape()[1], 3 - index);
    }
}

#[test]
fn synthesize_applies_a_style_vector() {
    let dir = tempfile::tempdir().expect("tempdir");
    let contents = format!("{TINY_CONFIG}gst_type: torchmoji\ngst_dim: 3\n");
    let config = write_config(dir.path(), &contents);
    let out = dir.path().join("out");
    let synthesize = |style: Option<&Path>| {
        let mut command = tacotron();
        command.args([
            "synthesize",
            "--config",
            config.to_str().unwrap(),
            "--symbols",
            "1,2,3",
            "--output-dir",
            out.to_str().unwrap(),
        ]);
        if let Some(style) = style {
            command.args(["--style", style.to_str().unwrap()]);
        }
        command.output().expect("run synthesize")
    };

    let missing = synthesize(None);
    assert!(!missing.status.success());
    let stderr = String::from_utf8_lossy(&missing.stderr);
    assert!(stderr.contains("--style"), "{stderr}");

    let style = dir.path().join("style.safetensors");
    let values: Vec<u8> = [0.25f32, -0.5, 1.0]
        .iter()
        .flat_map(|v| v.to_le_bytes())
        .collect();
    let view = safetensors::tensor::TensorView::new(safetensors::Dtype::F32, vec![3], &values)
        .expect("view");
    let tensors = std::collections::HashMap::from([("style".to_string(), view)]);
    let bytes = safetensors::serialize(&tensors, &None).expect("serialize style");
    std::fs::write(&style, bytes).expect("write style");

    let output = synthesize(Some(&style));
    assert!(output.status.success(), "{}", String::from_utf8_lossy(&output.stderr));
    assert!(out.join("mel_0.safetensors").exists());
}
