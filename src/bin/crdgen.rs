use kube::CustomResourceExt;

fn main() -> anyhow::Result<()> {
    print!("{}", serde_yaml::to_string(&source_controller::resources::Source::crd())?);
    Ok(())
}
