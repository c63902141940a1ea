mod common;

use burn::optim::GradientsParams;
use burn_ndarray::NdArrayDevice;
use common::{ramp_item, tiny_hparams, TestBackend, TrainBackend, N_MEL};
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use std::path::Path;
use std::sync::atomic::Ordering;
use tacotron::config::{FramesPerStepStage, HParams};
use tacotron::data::{save_mel, TextMelCollate, TextMelItem};
use tacotron::model::tacotron2::Tacotron2;
use tacotron::train::grad::{clip_grad_norm_per_group, group_grad_norm, PARAMETER_GROUPS};
use tacotron::train::loss::Tacotron2Loss;
use tacotron::train::summary::MemorySummaryWriter;
use tacotron::train::trainer::{load_checkpoint, Tacotron2Trainer, TrainerConfig};

fn trainer_hparams(log_dir: &Path) -> HParams {
    HParams {
        log_dir: log_dir.to_path_buf(),
        checkpoint_name: Some("tiny".to_string()),
        training_audiopaths_and_text: Some(log_dir.join("train.jsonl")),
        val_audiopaths_and_text: Some(log_dir.join("val.jsonl")),
        ..tiny_hparams()
    }
}

fn items() -> (Vec<TextMelItem>, Vec<TextMelItem>) {
    let train = vec![
        ramp_item(vec![1, 2, 3, 4], 6),
        ramp_item(vec![5, 6, 7], 4),
    ];
    let val = vec![ramp_item(vec![8, 9, 10], 5)];
    (train, val)
}

fn trainer(hparams: HParams) -> Tacotron2Trainer<TrainBackend> {
    let config = TrainerConfig::from_hparams(hparams).expect("trainer config");
    Tacotron2Trainer::new(config, NdArrayDevice::default())
}

#[test]
fn missing_required_params_are_named() {
    let err = TrainerConfig::from_hparams(tiny_hparams()).unwrap_err();
    assert_eq!(
        err.to_string(),
        "Tacotron2Trainer missing a required param: training_audiopaths_and_text"
    );

    let dir = tempfile::tempdir().expect("tempdir");
    let hparams = HParams {
        checkpoint_name: None,
        ..trainer_hparams(dir.path())
    };
    let err = TrainerConfig::from_hparams(hparams).unwrap_err();
    assert!(err.to_string().ends_with("checkpoint_name"));
}

#[test]
fn one_epoch_logs_scalars_and_writes_a_loadable_checkpoint() {
    let dir = tempfile::tempdir().expect("tempdir");
    let hparams = trainer_hparams(dir.path());
    let trainer = trainer(hparams.clone());
    let (train, val) = items();
    let mut writer = MemorySummaryWriter::default();

    let model = trainer.init_model().expect("model");
    trainer
        .train_on(model, &train, &val, &mut writer)
        .expect("train");

    let losses = writer.scalar_values("training/loss");
    assert_eq!(losses.len(), 1);
    assert!(losses[0].is_finite() && losses[0] > 0.0);
    assert_eq!(writer.scalar_values("validation/loss").len(), 1);
    assert_eq!(writer.scalar_values("training/encoder_grad_norm").len(), 1);
    assert!(writer
        .matrices
        .iter()
        .any(|(tag, _, rows, _)| tag == "samples/mel" && *rows == N_MEL));

    let checkpoint = trainer.config.checkpoint_path("0");
    assert!(checkpoint.with_extension("mpk").exists());
    let restored =
        load_checkpoint::<TestBackend>(&hparams, &checkpoint, &NdArrayDevice::default())
            .expect("load checkpoint");
    assert_eq!(restored.frames_per_step(), 1);
}

#[test]
fn frames_per_step_follows_the_schedule() {
    let dir = tempfile::tempdir().expect("tempdir");
    let hparams = HParams {
        batch_size: 1,
        n_frames_per_step_initial: 2,
        frames_per_step_schedule: vec![
            FramesPerStepStage {
                until_iteration: Some(1),
                frames_per_step: 2,
            },
            FramesPerStepStage {
                until_iteration: None,
                frames_per_step: 1,
            },
        ],
        ..trainer_hparams(dir.path())
    };
    let trainer = trainer(hparams);
    let (train, val) = items();
    let mut writer = MemorySummaryWriter::default();

    let model = trainer.init_model().expect("model");
    let model = trainer
        .train_on(model, &train, &val, &mut writer)
        .expect("train");
    assert_eq!(
        writer.scalar_values("training/frames_per_step"),
        vec![2.0, 1.0]
    );
    assert_eq!(model.frames_per_step(), 1);
}

#[test]
fn interruption_saves_a_failure_checkpoint() {
    let dir = tempfile::tempdir().expect("tempdir");
    let trainer = trainer(trainer_hparams(dir.path()));
    trainer.interrupt_flag().store(true, Ordering::SeqCst);
    let (train, val) = items();
    let mut writer = MemorySummaryWriter::default();

    let model = trainer.init_model().expect("model");
    let err = trainer
        .train_on(model, &train, &val, &mut writer)
        .unwrap_err();
    assert!(err.to_string().contains("interrupted"));
    assert!(trainer
        .config
        .checkpoint_path("failed_0")
        .with_extension("mpk")
        .exists());
    assert!(writer.scalars.is_empty());
}

#[test]
fn train_reads_manifests_from_disk() {
    let dir = tempfile::tempdir().expect("tempdir");
    let hparams = HParams {
        save_every: 5,
        ..trainer_hparams(dir.path())
    };
    let (train, val) = items();
    let write_manifest = |name: &str, items: &[TextMelItem]| {
        let mut lines = String::new();
        for (i, item) in items.iter().enumerate() {
            let mel_name = format!("{name}_{i}.safetensors");
            save_mel(&dir.path().join(&mel_name), &item.mel, N_MEL).expect("save mel");
            lines.push_str(&format!(
                "{{\"symbols\": {:?}, \"mel\": \"{mel_name}\"}}\n",
                item.symbols
            ));
        }
        std::fs::write(dir.path().join(format!("{name}.jsonl")), lines).expect("manifest");
    };
    write_manifest("train", &train);
    write_manifest("val", &val);

    let trainer = trainer(hparams);
    let mut writer = MemorySummaryWriter::default();
    trainer.train(&mut writer).expect("train");
    assert_eq!(writer.scalar_values("training/loss").len(), 1);
    // epoch 0 is a multiple of every save interval
    assert!(trainer.config.checkpoint_path("0").with_extension("mpk").exists());
}

#[test]
fn clipping_bounds_every_group_norm() {
    let device = NdArrayDevice::default();
    let hparams = tiny_hparams();
    let model = Tacotron2::<TrainBackend>::from_hparams(&hparams, &device).expect("model");
    let (train, _) = items();
    let batch = TextMelCollate::new(N_MEL, 1)
        .collate::<TrainBackend>(&train, &device)
        .expect("batch");
    let mut rng = ChaCha8Rng::seed_from_u64(11);
    let output = model.forward(&batch, &mut rng).expect("forward");
    let losses = Tacotron2Loss::default()
        .forward(
            &output,
            batch.mel.clone().expect("mel"),
            batch.gate.clone().expect("gate"),
            batch.output_lengths.as_deref().expect("lengths"),
        )
        .expect("loss");
    let mut grads = GradientsParams::from_grads(losses.loss.backward(), &model);

    let max_norm = 1e-5;
    let before = clip_grad_norm_per_group(&model, &mut grads, max_norm);
    let groups: Vec<&str> = before.iter().map(|(group, _)| *group).collect();
    assert_eq!(groups, vec!["embedding", "encoder", "decoder", "postnet"]);
    assert!(before.iter().all(|(_, norm)| *norm > max_norm));

    for group in PARAMETER_GROUPS {
        if let Some(norm) = group_grad_norm(&model, &grads, group) {
            assert!(norm <= max_norm * 1.01, "{group} norm {norm}");
        }
    }
}
