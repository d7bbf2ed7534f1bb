use sdxl_lora_core::{
    Capability, LoadError, LoadOptions, LoaderCapabilities, ModelSource, Pipeline,
};

#[test]
fn single_file_without_the_capability_fails_fast() {
    let caps = LoaderCapabilities {
        single_file: Capability::Unsupported,
    };
    let result = Pipeline::load_with_capabilities(
        ModelSource::from_path("/does/not/exist/sdxl.safetensors"),
        &LoadOptions::default(),
        &caps,
    );
    let Err(err) = result else {
        panic!("expected the load to fail");
    };
    assert!(err.to_string().contains("from_single_file"));
    assert!(matches!(
        err.downcast_ref::<LoadError>(),
        Some(LoadError::MissingCapability { .. })
    ));
}

#[test]
fn directories_need_a_model_index() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    std::fs::create_dir_all(dir.path().join("unet"))?;
    let options = LoadOptions {
        silent: true,
        ..Default::default()
    };
    let Err(err) = Pipeline::load(ModelSource::from_path(dir.path()), &options) else {
        panic!("expected the load to fail");
    };
    assert!(err.to_string().contains("model_index.json"));
    Ok(())
}
