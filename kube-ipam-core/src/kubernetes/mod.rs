use kube::{Api, Client, Resource};

pub mod operations;

pub trait GetApi {
    fn global_api<T>(&self) -> Api<T>
    where
        T: Resource<DynamicType = ()>;
}

impl GetApi for Client {
    fn global_api<T>(&self) -> Api<T>
    where
        T: Resource<DynamicType = ()>,
    {
        Api::all(self.clone())
    }
}

pub fn is_not_found(error: &kube::Error) -> bool {
    matches!(error, kube::Error::Api(response) if response.code == 404)
}

pub fn is_conflict(error: &kube::Error) -> bool {
    matches!(error, kube::Error::Api(response) if response.code == 409)
}
