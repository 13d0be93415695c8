use variadics::{var_args, var_expr};

fn main() {
    let var_args!(a, b, c) = var_expr!(1, "hello");
    let _ = (a, b, c);
}
