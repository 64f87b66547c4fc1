use kcp_sim::crd::{garden_crds, kcp_crds, CloudResources};
use kube::CustomResourceExt;

fn main() -> anyhow::Result<()> {
    let mut crds = kcp_crds();
    crds.extend(garden_crds());
    crds.push(CloudResources::crd());

    let docs = crds
        .iter()
        .map(serde_yaml::to_string)
        .collect::<Result<Vec<_>, _>>()?;
    print!("{}", docs.join("---\n"));
    Ok(())
}
