use kube::core::CustomResourceExt;
use oprc_mcs::crd::service_import::ServiceImport;

fn main() -> anyhow::Result<()> {
    let yaml = serde_yaml::to_string(&ServiceImport::crd())?;
    println!("{}", yaml);
    Ok(())
}
