use kube::CustomResourceExt;
use node_controller_apis::VirtualMachine;
use serde_yaml;

pub fn main() {
    println!("{}", serde_yaml::to_string(&VirtualMachine::crd()).unwrap());
}
