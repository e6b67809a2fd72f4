use kube::CustomResourceExt;

fn main() -> Result<(), serde_yaml::Error> {
    let mut crd = controller::LedgerNode::crd();
    if let Some(ref mut schema) = crd.spec.versions[0].schema {
        if let Some(ref mut api) = schema.open_api_v3_schema {
            if let Some(ref mut props) = api.properties {
                props.entry("spec".into()).and_modify(|spec| {
                    if let Some(ref mut props) = spec.properties {
                        props.entry("configOverride".into()).and_modify(|opt| {
                            opt.x_kubernetes_preserve_unknown_fields = Some(true);
                            opt.additional_properties = None;
                        });
                    }
                });
            }
        }
    }
    println!("---");
    print!("{}", serde_yaml::to_string(&crd)?);
    Ok(())
}
