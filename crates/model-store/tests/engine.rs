mod common;

use std::fs;
use std::sync::{Arc, Mutex};
use std::time::SystemTime;

use common::{Fixture, demo_tensors, gguf_bytes, leftover_temps, payload};
use gguf_parser::GGUFError;
use model_store::blob::STALE_TEMP_AGE;
use model_store::manifest::{MEDIA_TYPE_CONFIG, MEDIA_TYPE_MODEL};
use model_store::{
    Digest, ImportRequest, Layer, LayerRole, Manifest, MessageKey, ModelName, StoreError,
    TransferKind, TransferState,
};

fn no_progress(_: u64, _: u64) {}

#[test]
fn import_then_export_is_byte_identical() {
    let fx = Fixture::new();
    let src = fx.gguf("demo.gguf", "Demo Model", &demo_tensors());

    let seen = Mutex::new(Vec::new());
    let sink = |p: u64, t: u64| seen.lock().unwrap().push((p, t));
    let record = fx.engine.import(&ImportRequest::new(&src), &sink).unwrap();
    assert_eq!(record.name.short(), "demo:latest");

    let models = fx.engine.list().unwrap();
    assert_eq!(models.len(), 1);
    assert_eq!(models[0].name, "demo:latest");
    assert_eq!(models[0].tensor_count, 3);
    assert_eq!(models[0].architecture.as_deref(), Some("llama"));
    assert_eq!(models[0].quantization.as_deref(), Some("F32"));
    assert_eq!(record.manifest.count_role(LayerRole::Metadata), 1);

    let progress = seen.into_inner().unwrap();
    assert_eq!(progress.len(), 4);
    assert!(progress.windows(2).all(|w| w[0].0 < w[1].0));
    let (last, total) = *progress.last().unwrap();
    assert_eq!(last, total);

    let out = fx.path("out/demo-copy.gguf");
    fs::create_dir_all(out.parent().unwrap()).unwrap();
    let seen = Mutex::new(Vec::new());
    let sink = |p: u64, t: u64| seen.lock().unwrap().push((p, t));
    let written = fx.engine.export("demo", &out, &sink).unwrap();
    let progress = seen.into_inner().unwrap();
    assert_eq!(progress.len(), 4);
    assert!(progress.windows(2).all(|w| w[0].0 < w[1].0));
    let (last, total) = *progress.last().unwrap();
    assert_eq!(last, total);
    let original = fs::read(&src).unwrap();
    assert_eq!(written as usize, original.len());
    assert_eq!(fs::read(&out).unwrap(), original);
    assert_eq!(leftover_temps(out.parent().unwrap()), 0);
}

#[test]
fn bad_magic_creates_nothing() {
    let fx = Fixture::new();
    let mut bytes = gguf_bytes("Broken", &demo_tensors());
    bytes[0] ^= 0xff;
    let src = fx.path("broken.gguf");
    fs::write(&src, bytes).unwrap();

    let err = fx
        .engine
        .import(&ImportRequest::new(&src), &no_progress)
        .unwrap_err();
    assert!(
        matches!(
            err.root(),
            StoreError::InvalidModelFile(GGUFError::UnsupportedFormat(_))
        ),
        "{err}"
    );
    assert_eq!(err.message_key(), MessageKey::ImportFailure);
    assert!(fx.engine.list().unwrap().is_empty());
    assert_eq!(fx.blob_files(), 0);
}

#[test]
fn shared_tensor_is_stored_once() {
    let fx = Fixture::new();
    let shared = payload(9, 64);
    let a = fx.gguf(
        "alpha.gguf",
        "Alpha",
        &[("shared.weight", shared.clone()), ("a.weight", payload(1, 8))],
    );
    let b = fx.gguf(
        "beta.gguf",
        "Beta",
        &[("shared.weight", shared.clone()), ("b.weight", payload(2, 8))],
    );
    fx.engine.import(&ImportRequest::new(&a), &no_progress).unwrap();
    fx.engine.import(&ImportRequest::new(&b), &no_progress).unwrap();

    let digest = Digest::of(&shared);
    assert_eq!(fx.engine.blobs().ref_count(&digest), 2);

    let names: Vec<_> = fx.engine.list().unwrap().into_iter().map(|m| m.name).collect();
    assert_eq!(names, ["alpha:latest", "beta:latest"]);

    // 2 headers + 2 configs + 3 distinct tensors
    assert_eq!(fx.blob_files(), 7);

    fx.engine.delete("alpha").unwrap();
    assert!(fx.engine.blobs().exists(&digest));
    assert_eq!(fx.engine.blobs().ref_count(&digest), 1);
    assert!(!fx.engine.blobs().exists(&Digest::of(&payload(1, 8))));

    fx.engine.delete("beta").unwrap();
    assert_eq!(fx.blob_files(), 0);
}

#[test]
fn corrupted_blob_fails_export_and_leaves_no_output() {
    let fx = Fixture::new();
    let src = fx.gguf("demo.gguf", "Demo", &demo_tensors());
    let record = fx.engine.import(&ImportRequest::new(&src), &no_progress).unwrap();

    let victim = record
        .manifest
        .layers
        .iter()
        .find(|l| l.role() == LayerRole::Tensor)
        .unwrap();
    let path = fx.engine.blobs().path(&victim.digest);
    let mut bytes = fs::read(&path).unwrap();
    bytes[0] ^= 0x80;
    fs::write(&path, bytes).unwrap();

    let out = fx.path("demo-out.gguf");
    let err = fx.engine.export("demo", &out, &no_progress).unwrap_err();
    assert!(matches!(err, StoreError::ExportFailed { .. }), "{err}");
    assert!(matches!(err.root(), StoreError::Integrity { .. }), "{err}");
    assert_eq!(err.message_key(), MessageKey::ExportFailure);
    assert!(!out.exists());
    assert_eq!(leftover_temps(fx.dir.path()), 0);
    // Export never mutates the store.
    assert_eq!(fx.engine.list().unwrap().len(), 1);
    assert_eq!(fx.engine.blobs().ref_count(&victim.digest), 1);
}

#[test]
fn cancelled_import_leaves_store_unchanged() {
    let fx = Fixture::new();
    let src = fx.gguf("demo.gguf", "Demo", &demo_tensors());

    let session = fx.engine.begin(TransferKind::Import, "demo");
    let handle = Arc::clone(&session);
    let cancel_on_first = move |_: u64, _: u64| handle.cancel();
    let err = fx
        .engine
        .import_with(&session, &ImportRequest::new(&src), &cancel_on_first)
        .unwrap_err();

    assert!(matches!(err, StoreError::Cancelled), "{err}");
    assert_eq!(session.state(), TransferState::Cancelled);
    assert!(fx.engine.sessions().get(session.id()).is_none());
    assert!(fx.engine.list().unwrap().is_empty());
    assert_eq!(fx.blob_files(), 0);
}

#[test]
fn cancelled_export_leaves_no_output() {
    let fx = Fixture::new();
    let src = fx.gguf("demo.gguf", "Demo", &demo_tensors());
    let record = fx.engine.import(&ImportRequest::new(&src), &no_progress).unwrap();

    let session = fx.engine.begin(TransferKind::Export, "demo");
    let handle = Arc::clone(&session);
    let cancel_on_first = move |_: u64, _: u64| handle.cancel();
    let out = fx.path("demo-out.gguf");
    let err = fx
        .engine
        .export_with(&session, "demo", &out, &cancel_on_first)
        .unwrap_err();

    assert!(matches!(err, StoreError::Cancelled), "{err}");
    assert_eq!(session.state(), TransferState::Cancelled);
    assert!(fx.engine.sessions().get(session.id()).is_none());
    assert!(!out.exists());
    assert_eq!(leftover_temps(fx.dir.path()), 0);
    for digest in record.manifest.digests() {
        assert_eq!(fx.engine.blobs().ref_count(digest), 1);
    }
    assert_eq!(fx.engine.list().unwrap().len(), 1);
}

#[test]
fn manifest_copied_by_another_tool_keeps_its_blobs() {
    let fx = Fixture::new();
    let src = fx.gguf("demo.gguf", "Demo", &demo_tensors());
    let record = fx.engine.import(&ImportRequest::new(&src), &no_progress).unwrap();

    // Written behind the engine's back, as `ollama cp` would.
    let layout = fx.engine.layout();
    let copy = layout.manifest_path(&"demo2".parse().unwrap());
    fs::create_dir_all(copy.parent().unwrap()).unwrap();
    fs::copy(layout.manifest_path(&record.name), &copy).unwrap();

    fx.engine.delete("demo").unwrap();
    for digest in record.manifest.digests() {
        assert!(fx.engine.blobs().exists(digest), "{digest} was removed");
    }

    let out = fx.path("demo2.gguf");
    fx.engine.export("demo2", &out, &no_progress).unwrap();
    assert_eq!(fs::read(&out).unwrap(), fs::read(&src).unwrap());
    assert_eq!(fx.engine.prune().unwrap().blobs_removed, 0);

    // Once the store itself sees demo2, deleting it frees everything.
    let fx = fx.reopen();
    fx.engine.delete("demo2").unwrap();
    assert_eq!(fx.blob_files(), 0);
}

#[test]
fn reimport_without_overwrite_is_duplicate() {
    let fx = Fixture::new();
    let src = fx.gguf("demo.gguf", "Demo", &demo_tensors());
    fx.engine.import(&ImportRequest::new(&src), &no_progress).unwrap();
    let blobs_before = fx.blob_files();

    let err = fx
        .engine
        .import(&ImportRequest::new(&src), &no_progress)
        .unwrap_err();
    assert!(matches!(err.root(), StoreError::DuplicateModel(_)), "{err}");
    assert_eq!(fx.blob_files(), blobs_before);

    let other = fx.gguf("other.gguf", "Other", &[("x.weight", payload(5, 4))]);
    let record = fx
        .engine
        .import(&ImportRequest::new(&other).named("demo").overwrite(true), &no_progress)
        .unwrap();
    assert_eq!(record.manifest.count_role(LayerRole::Tensor), 1);
    assert_eq!(fx.engine.list().unwrap().len(), 1);
    // Only the new model's header, config and tensor remain.
    assert_eq!(fx.blob_files(), 3);
}

#[test]
fn name_falls_back_to_general_name() {
    let fx = Fixture::new();
    let src = fx.gguf("___.gguf", "Tiny Llama", &demo_tensors());
    let record = fx.engine.import(&ImportRequest::new(&src), &no_progress).unwrap();
    assert_eq!(record.name.short(), "tiny-llama:latest");

    let err = fx
        .engine
        .import(&ImportRequest::new(&src).named("bad name!"), &no_progress)
        .unwrap_err();
    assert!(matches!(err.root(), StoreError::InvalidModelName { .. }), "{err}");
}

#[test]
fn single_blob_model_exports_verbatim() {
    let fx = Fixture::new();
    let bytes = gguf_bytes("Native", &demo_tensors());
    let blobs = fx.engine.blobs();
    let model = blobs.write(&bytes).unwrap();
    let config = blobs.write(br#"{"model_format":"gguf","model_family":"llama"}"#).unwrap();
    let manifest = Manifest::new(
        Layer::new(MEDIA_TYPE_CONFIG, config, blobs.size(&config).unwrap()),
        vec![
            Layer::new(MEDIA_TYPE_MODEL, model, bytes.len() as u64),
            Layer::new("application/vnd.ollama.image.template", blobs.write(b"{{ .Prompt }}").unwrap(), 13),
        ],
    );
    let name: ModelName = "native:q4".parse().unwrap();
    fx.engine.manifests().create(&name, &manifest, false).unwrap();

    let out = fx.path("native.gguf");
    fx.engine.export("native:q4", &out, &no_progress).unwrap();
    assert_eq!(fs::read(&out).unwrap(), bytes);

    let details = fx.engine.show("native:q4").unwrap();
    assert_eq!(details.entry.architecture.as_deref(), Some("llama"));
    assert_eq!(details.entry.layer_count, 2);
}

#[test]
fn export_of_unknown_model_fails_cleanly() {
    let fx = Fixture::new();
    let out = fx.path("missing.gguf");
    let err = fx.engine.export("missing", &out, &no_progress).unwrap_err();
    assert!(matches!(err.root(), StoreError::ModelNotFound(_)), "{err}");
    assert!(!out.exists());
}

#[test]
fn reopen_rebuilds_reference_counts() {
    let fx = Fixture::new();
    let src = fx.gguf("demo.gguf", "Demo", &demo_tensors());
    let record = fx.engine.import(&ImportRequest::new(&src), &no_progress).unwrap();
    let orphan = fx.engine.blobs().write(b"nobody points here").unwrap();
    let staged = fx.engine.blobs().write(b"another process is mid-import").unwrap();
    fs::File::options()
        .write(true)
        .open(fx.engine.blobs().path(&orphan))
        .unwrap()
        .set_modified(SystemTime::now() - STALE_TEMP_AGE * 2)
        .unwrap();
    let files = fx.blob_files();

    let fx = fx.reopen();
    for layer in &record.manifest.layers {
        assert_eq!(fx.engine.blobs().ref_count(&layer.digest), 1);
    }
    assert!(!fx.engine.blobs().exists(&orphan), "start-up prune removes orphans");
    assert!(fx.engine.blobs().exists(&staged), "recent blobs may be mid-import");
    assert_eq!(fx.blob_files(), files - 1);
    assert_eq!(fx.engine.list().unwrap().len(), 1);
}
