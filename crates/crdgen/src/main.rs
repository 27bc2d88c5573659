use contour_operator::api::v1alpha1::contour::Contour;
use kube::CustomResourceExt as _;

fn main() -> Result<(), serde_yaml::Error> {
    print!("{}", serde_yaml::to_string(&Contour::crd())?);
    Ok(())
}
